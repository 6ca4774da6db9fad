//! Timer queue.
//!
//! Armed timers ordered by deadline. Expiry is popped one timer at a time
//! so a callback that stops or closes another timer is observed before
//! that timer fires.

use std::collections::{BTreeSet, HashMap};

use super::OsHandleId;

/// Ordered by (deadline_ms, seq) so iteration yields the earliest
/// deadline first and equal deadlines in arming order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline_ms: u64,
    seq: u64,
    handle: OsHandleId,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    key: TimerKey,
    repeat_ms: u64,
}

/// Deadline-ordered set of armed timers
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    keys: BTreeSet<TimerKey>,
    armed: HashMap<OsHandleId, ArmedTimer>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer
    pub(crate) fn start(
        &mut self,
        handle: OsHandleId,
        now_ms: u64,
        timeout_ms: u64,
        repeat_ms: u64,
    ) {
        self.stop(handle);
        let key = self.key_for(handle, now_ms.saturating_add(timeout_ms));
        self.keys.insert(key);
        self.armed.insert(handle, ArmedTimer { key, repeat_ms });
    }

    /// Disarm a timer. Returns whether it was armed.
    pub(crate) fn stop(&mut self, handle: OsHandleId) -> bool {
        match self.armed.remove(&handle) {
            Some(timer) => {
                self.keys.remove(&timer.key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_armed(&self, handle: OsHandleId) -> bool {
        self.armed.contains_key(&handle)
    }

    /// Earliest deadline among armed timers
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.keys.iter().next().map(|k| k.deadline_ms)
    }

    /// Pop the earliest timer due at `now_ms`. Repeating timers are
    /// re-armed relative to `now_ms`; one-shot timers are disarmed.
    pub(crate) fn pop_expired(&mut self, now_ms: u64) -> Option<OsHandleId> {
        let key = *self.keys.iter().next()?;
        if key.deadline_ms > now_ms {
            return None;
        }
        self.keys.remove(&key);

        let repeat_ms = self.armed.get(&key.handle).map(|t| t.repeat_ms).unwrap_or(0);
        if repeat_ms > 0 {
            let next = self.key_for(key.handle, now_ms.saturating_add(repeat_ms));
            self.keys.insert(next);
            self.armed.insert(
                key.handle,
                ArmedTimer {
                    key: next,
                    repeat_ms,
                },
            );
        } else {
            self.armed.remove(&key.handle);
        }
        Some(key.handle)
    }

    fn key_for(&mut self, handle: OsHandleId, deadline_ms: u64) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        TimerKey {
            deadline_ms,
            seq,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order() {
        let mut q = TimerQueue::new();
        q.start(OsHandleId(1), 0, 20, 0);
        q.start(OsHandleId(2), 0, 10, 0);
        q.start(OsHandleId(3), 0, 10, 0);

        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.pop_expired(5), None);
        assert_eq!(q.pop_expired(15), Some(OsHandleId(2)));
        assert_eq!(q.pop_expired(15), Some(OsHandleId(3)));
        assert_eq!(q.pop_expired(15), None);
        assert_eq!(q.pop_expired(20), Some(OsHandleId(1)));
        assert!(!q.is_armed(OsHandleId(1)));
    }

    #[test]
    fn test_repeat_rearms() {
        let mut q = TimerQueue::new();
        q.start(OsHandleId(7), 0, 5, 5);

        assert_eq!(q.pop_expired(5), Some(OsHandleId(7)));
        assert!(q.is_armed(OsHandleId(7)));
        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.pop_expired(5), None);
    }

    #[test]
    fn test_stop_and_restart() {
        let mut q = TimerQueue::new();
        q.start(OsHandleId(1), 0, 5, 0);
        assert!(q.stop(OsHandleId(1)));
        assert!(!q.stop(OsHandleId(1)));
        assert_eq!(q.next_deadline(), None);

        q.start(OsHandleId(1), 0, 5, 0);
        q.start(OsHandleId(1), 0, 50, 0);
        assert_eq!(q.next_deadline(), Some(50));
    }
}
