//! Timer wheel of the engine
//!
//! Scheduling is write-only; cancellation happens lazily by generation
//! counter. Every SA carries a `timer_generation` that is bumped whenever
//! its scheduled future changes, and an event whose recorded generation no
//! longer matches is discarded when it fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::engine::Timestamp;
use crate::state::Serial;

/// The one lifecycle event an SA has scheduled at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    /// Start rekeying, soft deadline
    Rekey,
    /// Replace the SA even if rekeying never got anywhere
    Replace,
    /// Tear the SA down, hard deadline
    Expire,
}

/// Everything that can fire from the wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The retransmit ladder of an outstanding request; the event is stale
    /// as soon as the outstanding request it names was answered or resent
    Retransmit {
        /// Owning IKE SA
        ike: Serial,
        /// Message ID of the outstanding request
        message_id: u32,
        /// Attempt count at scheduling time
        attempt: u32,
    },
    /// Soft or hard lifetime of an IKE SA
    IkeLifecycle {
        /// Owning IKE SA
        ike: Serial,
        /// Which deadline fired
        kind: LifecycleKind,
        /// Stale-detection counter
        generation: u64,
    },
    /// Soft or hard lifetime of a Child SA
    ChildLifecycle {
        /// The child
        child: Serial,
        /// Which deadline fired
        kind: LifecycleKind,
        /// Stale-detection counter
        generation: u64,
    },
    /// Dead peer detection probe is due
    Liveness {
        /// Owning IKE SA
        ike: Serial,
        /// Stale-detection counter
        generation: u64,
    },
    /// A half-open IKE SA outlived its grace period
    HalfOpenReap {
        /// The half-open SA
        ike: Serial,
    },
    /// Sweep stale fragment reassembly groups
    FragmentReap,
}

#[derive(Debug)]
struct Entry {
    at: Timestamp,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the BinaryHeap pops the earliest deadline first
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The wheel itself
#[derive(Debug, Default)]
pub struct TimerWheel {
    entries: BinaryHeap<Entry>,
    seq: u64,
}

impl TimerWheel {
    /// Schedule an event at an absolute engine timestamp
    pub fn schedule(&mut self, at: Timestamp, event: TimerEvent) {
        self.seq += 1;
        self.entries.push(Entry {
            at,
            seq: self.seq,
            event,
        });
    }

    /// The earliest deadline, for the driver's sleep
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.entries.peek().map(|entry| entry.at)
    }

    /// Pop every event whose deadline has passed
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<TimerEvent> {
        let mut due = vec![];
        while let Some(entry) = self.entries.peek() {
            if entry.at > now {
                break;
            }
            if let Some(entry) = self.entries.pop() {
                due.push(entry.event);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn events_fire_in_deadline_order() {
        let mut wheel = TimerWheel::default();
        let base = Timestamp::default();
        wheel.schedule(base.add(Duration::from_secs(5)), TimerEvent::FragmentReap);
        wheel.schedule(
            base.add(Duration::from_secs(1)),
            TimerEvent::HalfOpenReap { ike: Serial(7) },
        );

        assert_eq!(wheel.next_deadline(), Some(base.add(Duration::from_secs(1))));
        assert!(wheel.pop_due(base).is_empty());

        let due = wheel.pop_due(base.add(Duration::from_secs(10)));
        assert_eq!(
            due,
            vec![
                TimerEvent::HalfOpenReap { ike: Serial(7) },
                TimerEvent::FragmentReap,
            ]
        );
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let mut wheel = TimerWheel::default();
        let at = Timestamp::default().add(Duration::from_secs(1));
        wheel.schedule(at, TimerEvent::HalfOpenReap { ike: Serial(1) });
        wheel.schedule(at, TimerEvent::HalfOpenReap { ike: Serial(2) });
        let due = wheel.pop_due(at);
        assert_eq!(
            due,
            vec![
                TimerEvent::HalfOpenReap { ike: Serial(1) },
                TimerEvent::HalfOpenReap { ike: Serial(2) },
            ]
        );
    }
}
