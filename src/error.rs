use nix::errno::Errno;

#[derive(Debug, Copy, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// An MDIO transaction with the PHY failed.
    #[error("MDIO bus transaction failed: {0}")]
    Bus(Errno),
    /// Operation requested is not supported by the PHY.
    #[error("Operation requested is not supported by the PHY.")]
    NotSupported,
    /// Invalid operation requested
    #[error("Invalid operation requested")]
    Invalid,
    /// The PTP block can only be configured while the link is up.
    #[error("Link is down")]
    LinkDown,
    /// The PHY has been removed.
    #[error("PHY device has gone away")]
    NoDevice,
    /// A worker thread could not be started.
    #[error("Out of resources")]
    NoResources,
}

impl Error {
    /// The errno the kernel glue should hand back to its caller.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Bus(errno) => *errno,
            Error::NotSupported => Errno::EOPNOTSUPP,
            Error::Invalid => Errno::EINVAL,
            Error::LinkDown => Errno::ENOLINK,
            Error::NoDevice => Errno::ENODEV,
            Error::NoResources => Errno::ENOMEM,
        }
    }

    /// Negative errno, the return convention of the PHY driver callbacks.
    pub fn to_kernel_code(&self) -> libc::c_int {
        -(self.errno() as libc::c_int)
    }
}
