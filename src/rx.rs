//! Receive timestamping.
//!
//! Arrival captures and the packets they belong to reach the driver in
//! either order. A capture that finds no queued packet is parked in a slot
//! for a few ticks; a packet that finds no parked capture is queued until
//! the worker reads its capture. Slots come from a fixed pool and are only
//! ever moved between the free and pending lists.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::capture::HardwareTimestamp;
use crate::hw::PtpHardware;
use crate::lock;
use crate::packet::{sequence_matches, NetStack, Packet, PendingPacket, PtpClass};
use crate::ticks::{reached, TickSource};

/// Number of arrival captures that can wait for their packet at once.
pub const RX_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    timestamp: HardwareTimestamp,
    expiry: u64,
}

/// Fixed arena of timestamp slots, each index on exactly one of the free
/// and pending lists.
pub struct SlotPool {
    slots: [Slot; RX_SLOTS],
    free: VecDeque<usize>,
    pending: VecDeque<usize>,
}

impl Default for SlotPool {
    fn default() -> Self {
        Self {
            slots: [Slot::default(); RX_SLOTS],
            free: (0..RX_SLOTS).collect(),
            pending: VecDeque::with_capacity(RX_SLOTS),
        }
    }
}

impl SlotPool {
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns every pending slot whose expiry has been reached to the free
    /// list.
    pub fn prune(&mut self, now: u64) -> usize {
        let before = self.pending.len();
        let slots = &self.slots;
        let free = &mut self.free;
        self.pending.retain(|&index| {
            if reached(now, slots[index].expiry) {
                debug!("rx timestamp seq {} expired", slots[index].timestamp.sequence_id);
                free.push_back(index);
                false
            } else {
                true
            }
        });
        before - self.pending.len()
    }

    /// Parks `timestamp` on the pending list until `expiry`. Returns `false`
    /// when no slot is free.
    pub fn park(&mut self, timestamp: HardwareTimestamp, expiry: u64) -> bool {
        let Some(index) = self.free.pop_front() else {
            return false;
        };
        self.slots[index] = Slot { timestamp, expiry };
        self.pending.push_back(index);
        true
    }

    /// Takes the oldest pending timestamp matching `sequence_id`, recycling
    /// its slot.
    pub fn take_match(&mut self, sequence_id: u16) -> Option<HardwareTimestamp> {
        let position = self.pending.iter().position(|&index| {
            sequence_matches(sequence_id, self.slots[index].timestamp.sequence_id)
        })?;
        let index = self.pending.remove(position)?;
        self.free.push_back(index);
        Some(self.slots[index].timestamp)
    }

    /// Slot conservation: every slot is on exactly one list.
    pub fn is_consistent(&self) -> bool {
        let mut seen = [false; RX_SLOTS];
        for &index in self.free.iter().chain(self.pending.iter()) {
            if index >= RX_SLOTS || seen[index] {
                return false;
            }
            seen[index] = true;
        }
        seen.iter().all(|&s| s)
    }
}

/// Result of handing a received packet to [`RxPipeline::try_match_on_arrival`].
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival<P> {
    /// Its capture was already parked; the packet went to the stack.
    Delivered,
    /// Queued until its capture is read.
    Queued,
    /// Not a PTP event message; the caller keeps the packet.
    NotPtp(P),
}

pub struct RxPipeline<P> {
    hw: Arc<PtpHardware>,
    stack: Arc<dyn NetStack<P>>,
    ticks: Arc<dyn TickSource>,
    timeout: u64,
    tick: Duration,
    // lock order: queue before pool
    queue: Mutex<VecDeque<PendingPacket<P>>>,
    pool: Mutex<SlotPool>,
}

impl<P: Packet> RxPipeline<P> {
    pub fn new(
        hw: Arc<PtpHardware>,
        stack: Arc<dyn NetStack<P>>,
        ticks: Arc<dyn TickSource>,
        timeout: u64,
        tick: Duration,
    ) -> Self {
        Self {
            hw,
            stack,
            ticks,
            timeout,
            tick,
            queue: Mutex::new(VecDeque::new()),
            pool: Mutex::new(SlotPool::default()),
        }
    }

    /// Appends a packet to the queue of packets waiting for their capture.
    pub fn enqueue(&self, packet: P, class: PtpClass) {
        let expiry = self.ticks.now() + self.timeout;
        lock(&self.queue).push_back(PendingPacket {
            packet,
            class,
            expiry,
        });
    }

    /// Looks for an already parked capture of `packet` and delivers it right
    /// away, or queues the packet for the worker.
    pub fn try_match_on_arrival(&self, packet: P, class: PtpClass) -> Arrival<P> {
        let header = match packet.ptp_header(class) {
            Some(header) if header.message_type.is_event() => header,
            _ => return Arrival::NotPtp(packet),
        };

        let expiry = self.ticks.now() + self.timeout;
        let mut queue = lock(&self.queue);
        let found = lock(&self.pool).take_match(header.sequence_id);
        match found {
            Some(timestamp) => {
                drop(queue);
                debug!("rx seq {} matched parked timestamp", header.sequence_id);
                self.stack.deliver_rx(packet, Some(timestamp.time()));
                Arrival::Delivered
            }
            None => {
                queue.push_back(PendingPacket {
                    packet,
                    class,
                    expiry,
                });
                Arrival::Queued
            }
        }
    }

    /// One run of the deferred worker. Returns when it wants to run again.
    pub fn run(&self) -> Option<Duration> {
        let now = self.ticks.now();
        self.expire_packets(now);

        let has_free = {
            let mut pool = lock(&self.pool);
            pool.prune(now);
            pool.free_count() > 0
        };
        if !has_free {
            warn!("rx timestamp pool exhausted");
            return self.poll_delay();
        }

        let timestamp = match self.hw.read_arrival() {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => return self.poll_delay(),
            Err(e) => {
                error!("reading rx timestamp failed: {e}");
                return self.poll_delay();
            }
        };

        let mut queue = lock(&self.queue);
        let position = queue.iter().position(|pending| {
            pending.header().map_or(false, |header| {
                header.message_type.is_event()
                    && sequence_matches(header.sequence_id, timestamp.sequence_id)
            })
        });
        let matched = position.and_then(|position| queue.remove(position));
        match matched {
            Some(pending) => {
                drop(queue);
                debug!("rx timestamp seq {} matched queued packet", timestamp.sequence_id);
                self.stack.deliver_rx(pending.packet, Some(timestamp.time()));
            }
            None => {
                if !lock(&self.pool).park(timestamp, now + self.timeout) {
                    warn!("rx timestamp seq {} dropped, no free slot", timestamp.sequence_id);
                }
            }
        }

        // more captures may be latched behind this one
        Some(Duration::ZERO)
    }

    fn poll_delay(&self) -> Option<Duration> {
        if lock(&self.queue).is_empty() {
            None
        } else {
            Some(self.tick)
        }
    }

    /// Hands packets that waited too long to the stack without a timestamp.
    fn expire_packets(&self, now: u64) {
        let mut expired = Vec::new();
        {
            let mut queue = lock(&self.queue);
            let mut index = 0;
            while index < queue.len() {
                if reached(now, queue[index].expiry) {
                    expired.extend(queue.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for pending in expired {
            debug!("rx packet delivered without timestamp");
            self.stack.deliver_rx(pending.packet, None);
        }
    }

    /// Drops every queued packet. Returns how many there were.
    pub fn purge(&self) -> usize {
        let mut queue = lock(&self.queue);
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn free_slots(&self) -> usize {
        lock(&self.pool).free_count()
    }

    pub fn pending_slots(&self) -> usize {
        lock(&self.pool).pending_count()
    }

    pub fn pool_is_consistent(&self) -> bool {
        lock(&self.pool).is_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChipVariant;
    use crate::hw::tests::sim_hardware;
    use crate::packet::tests::{RecordingStack, TestPacket};
    use crate::packet::MessageType;
    use crate::regs::PagedPhy;
    use crate::sim::SimPhy;
    use crate::ticks::ManualTicks;
    use crate::Timestamp;
    use nix::errno::Errno;

    const TIMEOUT: u64 = 3;

    struct Fixture {
        phy: Arc<PagedPhy<SimPhy>>,
        stack: Arc<RecordingStack>,
        ticks: Arc<ManualTicks>,
        rx: RxPipeline<TestPacket>,
    }

    fn fixture() -> Fixture {
        let (phy, hw) = sim_hardware(ChipVariant::Jl3xxx);
        let stack = Arc::new(RecordingStack::default());
        let ticks = Arc::new(ManualTicks::new(1000));
        let rx = RxPipeline::new(
            hw,
            stack.clone(),
            ticks.clone(),
            TIMEOUT,
            Duration::from_millis(4),
        );
        Fixture {
            phy,
            stack,
            ticks,
            rx,
        }
    }

    fn sync(id: u32, seq: u16) -> TestPacket {
        TestPacket::event(id, MessageType::Sync, seq)
    }

    #[test]
    fn queued_packet_gets_its_capture() {
        let f = fixture();
        assert_eq!(
            f.rx.try_match_on_arrival(sync(1, 42), PtpClass::V2_IPV4),
            Arrival::Queued
        );
        f.phy
            .bus()
            .latch_arrival(HardwareTimestamp::new(100, 500_000, 42));

        assert_eq!(f.rx.run(), Some(Duration::ZERO));
        assert_eq!(
            f.stack.rx(),
            vec![(sync(1, 42), Some(Timestamp::new(100, 500_000)))]
        );
        assert_eq!(f.rx.free_slots(), RX_SLOTS);
        assert_eq!(f.rx.pending_slots(), 0);
        assert_eq!(f.rx.queued(), 0);
    }

    #[test]
    fn parked_capture_waits_for_packet() {
        let f = fixture();
        f.phy.bus().latch_arrival(HardwareTimestamp::new(5, 6, 9));
        f.rx.run();
        assert_eq!(f.rx.pending_slots(), 1);
        assert_eq!(f.rx.free_slots(), RX_SLOTS - 1);

        assert_eq!(
            f.rx.try_match_on_arrival(sync(1, 9), PtpClass::V2_L2),
            Arrival::Delivered
        );
        assert_eq!(f.stack.rx(), vec![(sync(1, 9), Some(Timestamp::new(5, 6)))]);
        assert_eq!(f.rx.free_slots(), RX_SLOTS);
        assert!(f.rx.pool_is_consistent());
    }

    #[test]
    fn nonzero_sequence_must_match_exactly() {
        let f = fixture();
        f.phy.bus().latch_arrival(HardwareTimestamp::new(5, 6, 10));
        f.rx.run();

        assert_eq!(
            f.rx.try_match_on_arrival(sync(1, 11), PtpClass::V2_L2),
            Arrival::Queued
        );
        assert!(f.stack.rx().is_empty());
        assert_eq!(f.rx.pending_slots(), 1);
    }

    #[test]
    fn zero_sequence_is_a_wildcard() {
        let f = fixture();
        f.phy.bus().latch_arrival(HardwareTimestamp::new(5, 6, 4321));
        f.rx.run();

        assert_eq!(
            f.rx.try_match_on_arrival(sync(1, 0), PtpClass::V2_L2),
            Arrival::Delivered
        );
        assert_eq!(f.stack.rx()[0].1, Some(Timestamp::new(5, 6)));
    }

    #[test]
    fn non_event_messages_are_not_consumed() {
        let f = fixture();
        let announce = TestPacket::event(1, MessageType::Announce, 3);
        assert_eq!(
            f.rx.try_match_on_arrival(announce.clone(), PtpClass::V2_L2),
            Arrival::NotPtp(announce)
        );
        assert_eq!(f.rx.queued(), 0);
    }

    #[test]
    fn unmatched_captures_expire() {
        let f = fixture();
        f.phy.bus().latch_arrival(HardwareTimestamp::new(1, 1, 7));
        f.phy.bus().latch_arrival(HardwareTimestamp::new(1, 2, 8));
        f.rx.run();
        f.rx.run();
        assert_eq!(f.rx.pending_slots(), 2);

        // one tick short of the window: still parked
        f.ticks.advance(TIMEOUT - 1);
        assert_eq!(f.rx.run(), None);
        assert_eq!(f.rx.pending_slots(), 2);

        f.ticks.advance(1);
        f.rx.run();
        assert_eq!(f.rx.pending_slots(), 0);
        assert_eq!(f.rx.free_slots(), RX_SLOTS);
        assert!(f.rx.pool_is_consistent());
    }

    #[test]
    fn exhausted_pool_leaves_capture_latched() {
        let f = fixture();
        for seq in 1..=RX_SLOTS as u16 {
            f.phy.bus().latch_arrival(HardwareTimestamp::new(0, 0, seq));
            f.rx.run();
        }
        assert_eq!(f.rx.free_slots(), 0);

        f.phy.bus().latch_arrival(HardwareTimestamp::new(0, 0, 999));
        assert_eq!(f.rx.run(), None);
        assert_eq!(f.phy.bus().pending_arrivals(), 1);
        assert!(f.rx.pool_is_consistent());
    }

    #[test]
    fn bus_error_leaves_capture_for_next_run() {
        let f = fixture();
        f.rx.try_match_on_arrival(sync(1, 21), PtpClass::V2_IPV4);
        f.phy.bus().latch_arrival(HardwareTimestamp::new(3, 4, 21));
        f.phy.bus().fail_next(Errno::EIO);

        assert_eq!(f.rx.run(), Some(Duration::from_millis(4)));
        assert_eq!(f.phy.bus().pending_arrivals(), 1);
        assert_eq!(f.rx.queued(), 1);
        assert!(f.stack.rx().is_empty());

        assert_eq!(f.rx.run(), Some(Duration::ZERO));
        assert_eq!(f.stack.rx(), vec![(sync(1, 21), Some(Timestamp::new(3, 4)))]);
        assert_eq!(f.phy.bus().pending_arrivals(), 0);
        assert_eq!(f.rx.free_slots(), RX_SLOTS);
    }

    #[test]
    fn queued_packet_expires_without_timestamp() {
        let f = fixture();
        f.rx.try_match_on_arrival(sync(1, 5), PtpClass::V2_L2);
        assert_eq!(f.rx.run(), Some(Duration::from_millis(4)));

        f.ticks.advance(TIMEOUT);
        assert_eq!(f.rx.run(), None);
        assert_eq!(f.stack.rx(), vec![(sync(1, 5), None)]);
    }

    #[test]
    fn pool_conservation_under_mixed_operations() {
        let mut pool = SlotPool::default();
        for round in 0..200u64 {
            let seq = (round % 17) as u16 + 1;
            match round % 4 {
                0 | 1 => {
                    pool.park(HardwareTimestamp::new(round, 0, seq), round + 5);
                }
                2 => {
                    pool.take_match(seq);
                }
                _ => {
                    pool.prune(round);
                }
            }
            assert!(pool.is_consistent());
            assert_eq!(pool.free_count() + pool.pending_count(), RX_SLOTS);
        }
    }

    #[test]
    fn prune_respects_expiry() {
        let mut pool = SlotPool::default();
        pool.park(HardwareTimestamp::new(0, 0, 1), 10);
        assert_eq!(pool.prune(9), 0);
        assert_eq!(pool.prune(10), 1);
        assert_eq!(pool.free_count(), RX_SLOTS);
    }
}
