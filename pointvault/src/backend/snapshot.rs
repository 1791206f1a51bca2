//! Read snapshots shared by every cursor of one query.
//!
//! Each backend owns a [`SnapshotClock`]. Writers draw a sequence number from
//! it for every stored value while holding the lock that guards the value, and
//! keep superseded values in a [`Versions`] chain for as long as a live
//! snapshot may still need them. A [`Snapshot`] pins the sequence number it
//! was taken at; cursors opened with it see exactly the values whose sequence
//! number is not above that pin, whenever they are opened.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A consistent read point across every series of one backend.
///
/// Clones share the same pin. The pin is released when the last clone is
/// dropped, after which older versions become eligible for pruning.
#[derive(Clone)]
pub struct Snapshot {
    seq: u64,
    pin: Option<Arc<Pin>>,
}

impl Snapshot {
    /// A snapshot that sees whatever is current when each cursor fetches.
    ///
    /// Backends without versioning hand this out.
    pub fn latest() -> Self {
        Self {
            seq: u64::MAX,
            pin: None,
        }
    }

    /// The last sequence number visible through this snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns `true` if this snapshot does not hold back pruning.
    pub fn is_latest(&self) -> bool {
        self.pin.is_none()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("seq", &self.seq)
            .field("pinned", &self.pin.is_some())
            .finish()
    }
}

struct Pin {
    clock: Arc<Mutex<ClockState>>,
    seq: u64,
}

impl Drop for Pin {
    fn drop(&mut self) {
        let mut state = self.clock.lock();
        if let Some(count) = state.live.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                state.live.remove(&self.seq);
            }
        }
    }
}

#[derive(Debug, Default)]
struct ClockState {
    /// Last sequence number handed to a writer.
    seq: u64,
    /// Pinned sequence numbers and how many snapshots hold each.
    live: BTreeMap<u64, usize>,
}

impl ClockState {
    fn oldest_live(&self) -> Option<u64> {
        self.live.keys().next().copied()
    }
}

/// Sequence source and registry of live snapshots.
#[derive(Debug, Default)]
pub(crate) struct SnapshotClock {
    state: Arc<Mutex<ClockState>>,
}

impl SnapshotClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the next write sequence number.
    ///
    /// Also returns the oldest pinned snapshot, read under the same lock, so
    /// the caller can prune versions no snapshot can reach.
    pub(crate) fn next_seq(&self) -> (u64, Option<u64>) {
        let mut state = self.state.lock();
        state.seq += 1;
        (state.seq, state.oldest_live())
    }

    /// The oldest pinned snapshot, if any.
    pub(crate) fn oldest_live(&self) -> Option<u64> {
        self.state.lock().oldest_live()
    }

    /// Pins the current sequence number.
    pub(crate) fn pin(&self) -> Snapshot {
        let mut state = self.state.lock();
        let seq = state.seq;
        *state.live.entry(seq).or_insert(0) += 1;
        Snapshot {
            seq,
            pin: Some(Arc::new(Pin {
                clock: Arc::clone(&self.state),
                seq,
            })),
        }
    }
}

/// Every retained version stored at one timestamp, oldest first.
///
/// The chain is never empty.
#[derive(Debug, Clone)]
pub(crate) struct Versions<L> {
    chain: Vec<(u64, L)>,
}

impl<L> Versions<L> {
    pub(crate) fn new(seq: u64, loc: L) -> Self {
        Self {
            chain: vec![(seq, loc)],
        }
    }

    /// Records a newer version and drops those no live snapshot can see.
    pub(crate) fn push(&mut self, seq: u64, loc: L, oldest_live: Option<u64>) {
        self.push_retained(seq, loc);
        self.prune(oldest_live);
    }

    /// Records a newer version without pruning.
    pub(crate) fn push_retained(&mut self, seq: u64, loc: L) {
        self.chain.push((seq, loc));
    }

    /// Drops every version older than the newest one visible at
    /// `oldest_live`. With no live snapshot only the current version stays.
    pub(crate) fn prune(&mut self, oldest_live: Option<u64>) {
        let keep_from = match oldest_live {
            None => self.chain.len() - 1,
            Some(pinned) => self
                .chain
                .iter()
                .rposition(|(seq, _)| *seq <= pinned)
                .unwrap_or(0),
        };
        self.chain.drain(..keep_from);
    }

    /// The version a snapshot at `seq` sees, if it sees one at all.
    pub(crate) fn visible(&self, seq: u64) -> Option<&L> {
        self.chain
            .iter()
            .rev()
            .find(|(version, _)| *version <= seq)
            .map(|(_, loc)| loc)
    }

    /// Retained versions, oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &L)> {
        self.chain.iter().map(|(seq, loc)| (*seq, loc))
    }

    /// Number of retained versions.
    pub(crate) fn retained(&self) -> usize {
        self.chain.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pins_register_and_release() {
        let clock = SnapshotClock::new();
        assert_eq!(clock.next_seq(), (1, None));

        let first = clock.pin();
        let again = first.clone();
        assert_eq!(first.seq(), 1);
        assert_eq!(clock.next_seq(), (2, Some(1)));

        let second = clock.pin();
        assert_eq!(second.seq(), 2);
        drop(first);
        assert_eq!(clock.oldest_live(), Some(1));
        drop(again);
        assert_eq!(clock.oldest_live(), Some(2));
        drop(second);
        assert_eq!(clock.oldest_live(), None);
    }

    #[test]
    fn test_latest_sees_everything() {
        let snapshot = Snapshot::latest();
        assert!(snapshot.is_latest());
        let versions = Versions::new(41, "a");
        assert_eq!(versions.visible(snapshot.seq()), Some(&"a"));
    }

    #[test]
    fn test_visible_picks_newest_not_after_snapshot() {
        let mut versions = Versions::new(1, 'a');
        versions.push(5, 'b', Some(1));
        versions.push(9, 'c', Some(1));
        assert_eq!(versions.visible(0), None);
        assert_eq!(versions.visible(1), Some(&'a'));
        assert_eq!(versions.visible(8), Some(&'b'));
        assert_eq!(versions.visible(u64::MAX), Some(&'c'));
    }

    #[test]
    fn test_prune_keeps_what_oldest_snapshot_needs() {
        let mut versions = Versions::new(1, 'a');
        versions.push(3, 'b', Some(2));
        versions.push(6, 'c', Some(2));
        assert_eq!(versions.retained(), 3);

        versions.prune(Some(4));
        let kept: Vec<char> = versions.iter().map(|(_, loc)| *loc).collect();
        assert_eq!(kept, vec!['b', 'c']);

        versions.prune(None);
        assert_eq!(versions.retained(), 1);
        assert_eq!(versions.visible(u64::MAX), Some(&'c'));
    }
}
