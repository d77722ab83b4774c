//! PTP packet classification and the interface to the network stack.
use bitflags::bitflags;

use crate::Timestamp;

bitflags! {
    /// Classification of a packet by the kernel's PTP classifier, the
    /// `PTP_CLASS_*` bitmask. The low nibble holds the PTP version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PtpClass: u32 {
        const V1 = 0x01;
        const V2 = 0x02;
        const IPV4 = 0x10;
        const IPV6 = 0x20;
        const L2 = 0x40;
        const VLAN = 0x80;

        const V2_IPV4 = Self::V2.bits() | Self::IPV4.bits();
        const V2_IPV6 = Self::V2.bits() | Self::IPV6.bits();
        const V2_L2 = Self::V2.bits() | Self::L2.bits();
    }
}

impl PtpClass {
    pub const NONE: Self = Self::empty();
    pub const VERSION_MASK: u32 = 0x0f;
    pub const TRANSPORT_MASK: u32 = 0x70;

    pub const fn version(self) -> u32 {
        self.bits() & Self::VERSION_MASK
    }

    pub const fn is_l2(self) -> bool {
        self.bits() & Self::TRANSPORT_MASK == Self::L2.bits()
    }

    /// Whether the PHY can timestamp packets of this class at all.
    pub const fn is_supported(self) -> bool {
        self.version() == Self::V2.bits() && self.bits() & Self::TRANSPORT_MASK != 0
    }
}

/// PTP message types, the low nibble of the first header byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Sync,
    DelayReq,
    PdelayReq,
    PdelayResp,
    FollowUp,
    DelayResp,
    PdelayRespFollowUp,
    Announce,
    Signaling,
    Management,
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Option<Self> {
        let message = match value & 0x0f {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x2 => MessageType::PdelayReq,
            0x3 => MessageType::PdelayResp,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xa => MessageType::PdelayRespFollowUp,
            0xb => MessageType::Announce,
            0xc => MessageType::Signaling,
            0xd => MessageType::Management,
            _ => return None,
        };
        Some(message)
    }

    /// Event messages are the ones the PHY timestamps.
    pub const fn is_event(self) -> bool {
        matches!(
            self,
            MessageType::Sync
                | MessageType::DelayReq
                | MessageType::PdelayReq
                | MessageType::PdelayResp
        )
    }
}

/// The PTP header fields the matching pipelines need.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub sequence_id: u16,
}

impl PtpHeader {
    /// Parses a raw PTP header, as located by the classifier.
    pub fn parse(header: &[u8]) -> Option<Self> {
        let message_type = MessageType::from_nibble(*header.first()?)?;
        let sequence_id = u16::from_be_bytes([*header.get(30)?, *header.get(31)?]);
        Some(Self {
            message_type,
            sequence_id,
        })
    }
}

/// Whether a captured sequence id belongs to a packet expecting `expected`.
///
/// Some chips latch a zero sequence id for every capture, so zero on either
/// side matches anything. Two packets in flight at once can then swap
/// timestamps.
pub fn sequence_matches(expected: u16, captured: u16) -> bool {
    expected == 0 || captured == 0 || expected == captured
}

/// A network packet the PHY may timestamp.
pub trait Packet: Send + 'static {
    /// The PTP header of the packet, located according to `class`.
    fn ptp_header(&self, class: PtpClass) -> Option<PtpHeader>;
}

/// The network stack packets are handed back to.
pub trait NetStack<P>: Send + Sync {
    /// Delivers a received packet, with its arrival time when one was
    /// matched.
    fn deliver_rx(&self, packet: P, hwtstamp: Option<Timestamp>);

    /// Reports the departure time of a transmitted packet.
    fn complete_tx(&self, packet: P, hwtstamp: Timestamp);
}

/// A packet waiting for its hardware timestamp.
pub struct PendingPacket<P> {
    pub packet: P,
    pub class: PtpClass,
    /// Tick after which the packet stops waiting.
    pub expiry: u64,
}

impl<P: Packet> PendingPacket<P> {
    pub fn header(&self) -> Option<PtpHeader> {
        self.packet.ptp_header(self.class)
    }
}

/// Transmit timestamping modes, `HWTSTAMP_TX_*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum TxType {
    #[default]
    Off = 0,
    On = 1,
    OneStepSync = 2,
}

/// Receive filters, `HWTSTAMP_FILTER_*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum RxFilter {
    #[default]
    None = 0,
    PtpV2L4Event = 6,
    PtpV2L4Sync = 7,
    PtpV2L4DelayReq = 8,
    PtpV2L2Event = 9,
    PtpV2L2Sync = 10,
    PtpV2L2DelayReq = 11,
    PtpV2Event = 12,
    PtpV2Sync = 13,
    PtpV2DelayReq = 14,
}

impl RxFilter {
    /// Folds the sub-filters into the event filter of their transport; the
    /// PHY always captures every event message it is configured for.
    pub fn effective(self) -> Self {
        use RxFilter::*;
        match self {
            None => None,
            PtpV2L4Event | PtpV2L4Sync | PtpV2L4DelayReq => PtpV2L4Event,
            PtpV2L2Event | PtpV2L2Sync | PtpV2L2DelayReq => PtpV2L2Event,
            PtpV2Event | PtpV2Sync | PtpV2DelayReq => PtpV2Event,
        }
    }
}

/// Hardware timestamping configuration requested through `SIOCSHWTSTAMP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct HwTstampConfig {
    pub tx_type: TxType,
    pub rx_filter: RxFilter,
}

/// What `ethtool -T` reports for the PHY.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TsInfo {
    /// `SOF_TIMESTAMPING_*` flags.
    pub so_timestamping: u32,
    /// Bitmask over [`TxType`].
    pub tx_types: u32,
    /// Bitmask over [`RxFilter`].
    pub rx_filters: u32,
    pub phc_index: i32,
}

impl TsInfo {
    pub fn new(phc_index: i32) -> Self {
        Self {
            so_timestamping: libc::SOF_TIMESTAMPING_TX_HARDWARE
                | libc::SOF_TIMESTAMPING_RX_HARDWARE
                | libc::SOF_TIMESTAMPING_RAW_HARDWARE,
            tx_types: (1 << TxType::Off as u32)
                | (1 << TxType::On as u32)
                | (1 << TxType::OneStepSync as u32),
            rx_filters: (1 << RxFilter::None as u32)
                | (1 << RxFilter::PtpV2L4Event as u32)
                | (1 << RxFilter::PtpV2L2Event as u32)
                | (1 << RxFilter::PtpV2Event as u32),
            phc_index,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A packet that only carries the header fields.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct TestPacket {
        pub id: u32,
        pub header: Option<PtpHeader>,
    }

    impl TestPacket {
        pub(crate) fn event(id: u32, message_type: MessageType, sequence_id: u16) -> Self {
            Self {
                id,
                header: Some(PtpHeader {
                    message_type,
                    sequence_id,
                }),
            }
        }
    }

    impl Packet for TestPacket {
        fn ptp_header(&self, _class: PtpClass) -> Option<PtpHeader> {
            self.header
        }
    }

    /// Records everything handed back to the stack.
    #[derive(Default)]
    pub(crate) struct RecordingStack {
        pub rx: Mutex<Vec<(TestPacket, Option<Timestamp>)>>,
        pub tx: Mutex<Vec<(TestPacket, Timestamp)>>,
    }

    impl RecordingStack {
        pub(crate) fn rx(&self) -> Vec<(TestPacket, Option<Timestamp>)> {
            self.rx.lock().unwrap().clone()
        }

        pub(crate) fn tx(&self) -> Vec<(TestPacket, Timestamp)> {
            self.tx.lock().unwrap().clone()
        }
    }

    impl NetStack<TestPacket> for RecordingStack {
        fn deliver_rx(&self, packet: TestPacket, hwtstamp: Option<Timestamp>) {
            self.rx.lock().unwrap().push((packet, hwtstamp));
        }

        fn complete_tx(&self, packet: TestPacket, hwtstamp: Timestamp) {
            self.tx.lock().unwrap().push((packet, hwtstamp));
        }
    }

    #[test]
    fn parse_header() {
        let mut raw = [0u8; 34];
        raw[0] = 0x11; // transportSpecific 1, Delay_Req
        raw[30] = 0x01;
        raw[31] = 0x02;
        assert_eq!(
            PtpHeader::parse(&raw),
            Some(PtpHeader {
                message_type: MessageType::DelayReq,
                sequence_id: 0x0102
            })
        );
        assert_eq!(PtpHeader::parse(&raw[..20]), None);
    }

    #[test]
    fn wildcard_sequence() {
        assert!(sequence_matches(0, 1234));
        assert!(sequence_matches(1234, 0));
        assert!(sequence_matches(42, 42));
        assert!(!sequence_matches(42, 43));
    }

    #[test]
    fn classes() {
        assert!(PtpClass::V2_IPV4.is_supported());
        assert!(PtpClass::V2_L2.is_l2());
        assert!(!(PtpClass::V1 | PtpClass::IPV4).is_supported());
        assert!(!(PtpClass::V2 | PtpClass::VLAN).is_supported());
        assert!(!PtpClass::NONE.is_supported());
    }

    #[test]
    fn ts_info_bits() {
        let info = TsInfo::new(3);
        assert_eq!(info.tx_types, 0b111);
        assert_eq!(info.rx_filters, 1 | 1 << 6 | 1 << 9 | 1 << 12);
        assert_ne!(info.so_timestamping & libc::SOF_TIMESTAMPING_RAW_HARDWARE, 0);
        assert_eq!(info.phc_index, 3);
    }

    #[test]
    fn filters_fold() {
        assert_eq!(RxFilter::PtpV2L4Sync.effective(), RxFilter::PtpV2L4Event);
        assert_eq!(RxFilter::None.effective(), RxFilter::None);
    }
}
