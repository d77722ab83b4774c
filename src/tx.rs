//! Transmit timestamping. Packets are matched one at a time, in the order
//! they were sent, against the departure latch.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::hw::PtpHardware;
use crate::lock;
use crate::packet::{sequence_matches, MessageType, NetStack, Packet, PendingPacket, PtpClass};
use crate::ticks::{reached, TickSource};

/// What happened to a packet handed to [`TxPipeline::submit`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Submitted {
    /// Waiting for its departure capture.
    Queued,
    /// Stamped on the wire by the PHY itself or not timestampable; freed.
    Freed,
}

pub struct TxPipeline<P> {
    hw: Arc<PtpHardware>,
    stack: Arc<dyn NetStack<P>>,
    ticks: Arc<dyn TickSource>,
    timeout: u64,
    tick: Duration,
    strict: bool,
    one_step: AtomicBool,
    queue: Mutex<VecDeque<PendingPacket<P>>>,
}

impl<P: Packet> TxPipeline<P> {
    pub fn new(
        hw: Arc<PtpHardware>,
        stack: Arc<dyn NetStack<P>>,
        ticks: Arc<dyn TickSource>,
        timeout: u64,
        tick: Duration,
        strict: bool,
    ) -> Self {
        Self {
            hw,
            stack,
            ticks,
            timeout,
            tick,
            strict,
            one_step: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_one_step(&self, on: bool) {
        self.one_step.store(on, Ordering::Relaxed);
    }

    /// Whether the PHY stamps this message in-line when one-step mode is on.
    fn stamped_in_line(&self, message_type: MessageType) -> bool {
        match message_type {
            MessageType::Sync => true,
            MessageType::PdelayResp => self.hw.variant().peer_delay_capture(),
            _ => false,
        }
    }

    /// Takes ownership of an outgoing packet, queueing it when it needs a
    /// departure timestamp from the worker.
    pub fn submit(&self, packet: P, class: PtpClass) -> Submitted {
        let Some(header) = packet.ptp_header(class) else {
            return Submitted::Freed;
        };
        if !header.message_type.is_event() {
            return Submitted::Freed;
        }
        if self.one_step.load(Ordering::Relaxed) && self.stamped_in_line(header.message_type) {
            debug!("tx seq {} stamped in-line", header.sequence_id);
            return Submitted::Freed;
        }
        self.enqueue(packet, class);
        Submitted::Queued
    }

    pub fn enqueue(&self, packet: P, class: PtpClass) {
        let expiry = self.ticks.now() + self.timeout;
        lock(&self.queue).push_back(PendingPacket {
            packet,
            class,
            expiry,
        });
    }

    /// One run of the deferred worker. Returns when it wants to run again.
    pub fn run(&self) -> Option<Duration> {
        let now = self.ticks.now();
        let Some(pending) = lock(&self.queue).pop_front() else {
            return None;
        };

        if reached(now, pending.expiry) {
            warn!("tx timestamp timed out");
            return self.again();
        }

        let timestamp = match self.hw.read_departure(self.strict) {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => return self.requeue(pending),
            Err(e) => {
                error!("reading tx timestamp failed: {e}");
                return self.requeue(pending);
            }
        };

        let matches = pending.header().map_or(false, |header| {
            sequence_matches(header.sequence_id, timestamp.sequence_id)
        });
        if matches {
            debug!("tx timestamp seq {} delivered", timestamp.sequence_id);
            self.stack.complete_tx(pending.packet, timestamp.time());
        } else {
            warn!(
                "tx timestamp seq {} does not match queued packet, dropped",
                timestamp.sequence_id
            );
        }
        self.again()
    }

    /// Puts a packet whose capture is not latched yet back at the head of
    /// the queue; its expiry bounds the polling.
    fn requeue(&self, pending: PendingPacket<P>) -> Option<Duration> {
        lock(&self.queue).push_front(pending);
        Some(self.tick)
    }

    fn again(&self) -> Option<Duration> {
        if lock(&self.queue).is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        }
    }

    pub fn purge(&self) -> usize {
        let mut queue = lock(&self.queue);
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::HardwareTimestamp;
    use crate::config::ChipVariant;
    use crate::hw::tests::sim_hardware;
    use crate::packet::tests::{RecordingStack, TestPacket};
    use crate::regs::PagedPhy;
    use crate::sim::SimPhy;
    use crate::ticks::ManualTicks;
    use crate::Timestamp;
    use nix::errno::Errno;

    const TIMEOUT: u64 = 3;
    const TICK: Duration = Duration::from_millis(4);

    struct Fixture {
        phy: Arc<PagedPhy<SimPhy>>,
        stack: Arc<RecordingStack>,
        ticks: Arc<ManualTicks>,
        tx: TxPipeline<TestPacket>,
    }

    fn fixture(variant: ChipVariant, strict: bool) -> Fixture {
        let (phy, hw) = sim_hardware(variant);
        let stack = Arc::new(RecordingStack::default());
        let ticks = Arc::new(ManualTicks::new(0));
        let tx = TxPipeline::new(hw, stack.clone(), ticks.clone(), TIMEOUT, TICK, strict);
        Fixture {
            phy,
            stack,
            ticks,
            tx,
        }
    }

    fn delay_req(id: u32, seq: u16) -> TestPacket {
        TestPacket::event(id, MessageType::DelayReq, seq)
    }

    #[test]
    fn departure_completes_packet() {
        let f = fixture(ChipVariant::Jl3xxx, true);
        assert_eq!(f.tx.submit(delay_req(1, 77), PtpClass::V2_IPV4), Submitted::Queued);
        f.phy
            .bus()
            .latch_departure(HardwareTimestamp::new(20, 30, 77));

        assert_eq!(f.tx.run(), None);
        assert_eq!(f.stack.tx(), vec![(delay_req(1, 77), Timestamp::new(20, 30))]);
    }

    #[test]
    fn expired_packet_is_dropped_without_reading_hardware() {
        let f = fixture(ChipVariant::Jl3xxx, true);
        f.tx.submit(delay_req(1, 1), PtpClass::V2_IPV4);
        f.tx.submit(delay_req(2, 2), PtpClass::V2_IPV4);
        f.ticks.advance(TIMEOUT);

        let accesses = f.phy.bus().accesses();
        assert_eq!(f.tx.run(), Some(Duration::ZERO));
        assert_eq!(f.phy.bus().accesses(), accesses);
        assert_eq!(f.tx.queued(), 1);
        assert!(f.stack.tx().is_empty());
    }

    #[test]
    fn mismatch_drops_without_retry() {
        let f = fixture(ChipVariant::Jl3xxx, true);
        f.tx.submit(delay_req(1, 5), PtpClass::V2_IPV4);
        f.phy.bus().latch_departure(HardwareTimestamp::new(1, 1, 6));

        assert_eq!(f.tx.run(), None);
        assert_eq!(f.tx.queued(), 0);
        assert!(f.stack.tx().is_empty());
    }

    #[test]
    fn strict_check_polls_until_latched() {
        let f = fixture(ChipVariant::Jl3xxx, true);
        f.tx.submit(delay_req(1, 5), PtpClass::V2_IPV4);

        assert_eq!(f.tx.run(), Some(TICK));
        assert_eq!(f.tx.queued(), 1);

        f.phy.bus().latch_departure(HardwareTimestamp::new(1, 1, 5));
        assert_eq!(f.tx.run(), None);
        assert_eq!(f.stack.tx().len(), 1);
    }

    #[test]
    fn bus_error_requeues_packet() {
        let f = fixture(ChipVariant::Jl3xxx, true);
        f.tx.submit(delay_req(1, 12), PtpClass::V2_IPV4);
        f.phy.bus().latch_departure(HardwareTimestamp::new(9, 10, 12));
        f.phy.bus().fail_next(Errno::EIO);

        assert_eq!(f.tx.run(), Some(TICK));
        assert_eq!(f.tx.queued(), 1);
        assert_eq!(f.phy.bus().pending_departures(), 1);
        assert!(f.stack.tx().is_empty());

        assert_eq!(f.tx.run(), None);
        assert_eq!(f.stack.tx(), vec![(delay_req(1, 12), Timestamp::new(9, 10))]);
    }

    #[test]
    fn relaxed_check_reads_stale_latch() {
        let f = fixture(ChipVariant::Jl3xxx, false);
        f.tx.submit(delay_req(1, 5), PtpClass::V2_IPV4);
        f.phy.bus().latch_departure(HardwareTimestamp::new(1, 1, 5));
        f.tx.run();

        // nothing new latched; the stale capture carries the old sequence id
        f.tx.submit(delay_req(2, 6), PtpClass::V2_IPV4);
        assert_eq!(f.tx.run(), None);
        assert_eq!(f.stack.tx().len(), 1);
        assert_eq!(f.tx.queued(), 0);
    }

    #[test]
    fn one_step_sync_is_never_queued() {
        let f = fixture(ChipVariant::Jl2xxx, true);
        f.tx.set_one_step(true);

        let sync = TestPacket::event(1, MessageType::Sync, 1);
        assert_eq!(f.tx.submit(sync, PtpClass::V2_L2), Submitted::Freed);
        // peer delay responses are only stamped in-line on the three-port chip
        let resp = TestPacket::event(2, MessageType::PdelayResp, 1);
        assert_eq!(f.tx.submit(resp, PtpClass::V2_L2), Submitted::Queued);

        let f = fixture(ChipVariant::Jl3xxx, true);
        f.tx.set_one_step(true);
        let resp = TestPacket::event(2, MessageType::PdelayResp, 1);
        assert_eq!(f.tx.submit(resp, PtpClass::V2_L2), Submitted::Freed);
    }

    #[test]
    fn general_messages_are_freed() {
        let f = fixture(ChipVariant::Jl2xxx, true);
        let follow_up = TestPacket::event(1, MessageType::FollowUp, 1);
        assert_eq!(f.tx.submit(follow_up, PtpClass::V2_L2), Submitted::Freed);
        assert_eq!(f.tx.queued(), 0);
    }
}
