use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Hands out log sequence numbers and tracks which ones are still being
/// applied.
///
/// A number is taken under the lock of the entity it changes and released
/// once the change is visible. The watermark is the highest number below
/// every number still in flight, so a snapshot tagged with it contains the
/// effects of every record at or below its version.
#[derive(Debug)]
pub struct Sequencer {
    inner: Mutex<SeqState>,
}

#[derive(Debug)]
struct SeqState {
    next: u64,
    in_flight: BTreeSet<u64>,
}

impl Sequencer {
    /// Continue numbering after `last`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            inner: Mutex::new(SeqState {
                next: last + 1,
                in_flight: BTreeSet::new(),
            }),
        }
    }

    pub fn begin(&self) -> Ticket<'_> {
        let mut inner = self.inner.lock();
        let seq = inner.next;
        inner.next += 1;
        inner.in_flight.insert(seq);
        Ticket {
            seq,
            sequencer: self,
        }
    }

    pub fn watermark(&self) -> u64 {
        let inner = self.inner.lock();
        match inner.in_flight.first() {
            Some(oldest) => oldest - 1,
            None => inner.next - 1,
        }
    }

    pub fn last_issued(&self) -> u64 {
        self.inner.lock().next - 1
    }

    fn finish(&self, seq: u64) {
        self.inner.lock().in_flight.remove(&seq);
    }
}

/// An issued sequence number; dropping it marks the change as applied.
#[derive(Debug)]
pub struct Ticket<'a> {
    seq: u64,
    sequencer: &'a Sequencer,
}

impl Ticket<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.sequencer.finish(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_continue_after_recovery() {
        let seq = Sequencer::starting_after(41);
        assert_eq!(seq.watermark(), 41);
        let t = seq.begin();
        assert_eq!(t.seq(), 42);
        drop(t);
        assert_eq!(seq.watermark(), 42);
        assert_eq!(seq.last_issued(), 42);
    }

    #[test]
    fn test_watermark_waits_for_oldest_in_flight() {
        let seq = Sequencer::starting_after(0);
        let a = seq.begin();
        let b = seq.begin();
        let c = seq.begin();
        assert_eq!(seq.watermark(), 0);
        drop(b);
        assert_eq!(seq.watermark(), 0);
        drop(a);
        assert_eq!(seq.watermark(), 2);
        drop(c);
        assert_eq!(seq.watermark(), 3);
    }
}
