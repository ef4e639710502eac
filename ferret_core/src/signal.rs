use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::HashSet;

/// Ordered sequence of coverage addresses for a single call.
///
/// Unlike [`Signal`], a cover keeps the order in which addresses were observed.
pub type Cover = Vec<u32>;

/// Deduplicated set of coverage identifiers.
///
/// Raw per-call signal from the environment is a plain `&[u32]` that may hold
/// duplicates; [`Signal::canonicalize`] turns it into this set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal(BTreeSet<u32>);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes raw per-call signal into a set.
    pub fn canonicalize(raw: &[u32]) -> Self {
        raw.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Elements of `self` or `other`.
    pub fn union(&self, other: &Signal) -> Signal {
        Signal(self.0.union(&other.0).copied().collect())
    }

    /// Elements of `self` that are absent from `other`.
    pub fn diff(&self, other: &Signal) -> Signal {
        Signal(self.0.difference(&other.0).copied().collect())
    }

    /// Elements present in both `self` and `other`.
    pub fn intersection(&self, other: &Signal) -> Signal {
        Signal(self.0.intersection(&other.0).copied().collect())
    }

    /// Returns `true` if `self` holds at least one element missing from `base`.
    pub fn has_novel(&self, base: &Signal) -> bool {
        self.0.iter().any(|id| !base.0.contains(id))
    }

    pub fn is_superset(&self, other: &Signal) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Adds every element of `other` to `self`.
    pub fn merge(&mut self, other: &Signal) {
        self.0.extend(other.0.iter().copied());
    }

    fn merge_raw(&mut self, raw: &[u32]) {
        self.0.extend(raw.iter().copied());
    }

    /// Sorted identifiers, the wire representation reported to the manager.
    pub fn into_vec(self) -> Vec<u32> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<u32> for Signal {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Signal(iter.into_iter().collect())
    }
}

/// Order-preserving union of two covers: `a`, followed by the addresses of
/// `b` that `a` does not already contain.
pub fn cover_union(a: &[u32], b: &[u32]) -> Cover {
    let mut seen: HashSet<u32> = a.iter().copied().collect();
    let mut out = a.to_vec();
    for &pc in b {
        if seen.insert(pc) {
            out.push(pc);
        }
    }
    out
}

#[derive(Debug, Default)]
struct SignalSets {
    corpus: Signal,
    max: Signal,
    new: Signal,
}

/// The three signal sets every worker shares, behind one reader/writer lock.
///
/// * corpus signal: signal already represented in the saved corpus,
/// * max signal: corpus signal plus everything observed during this run,
/// * new signal: signal discovered during this run.
///
/// Corpus and new signal are always subsets of max signal.
///
/// Novelty checks take the shared lock; only recording new signal or
/// growing the corpus signal takes the exclusive one.
#[derive(Debug, Default)]
pub struct SignalStore {
    sets: RwLock<SignalSets>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose max signal starts from `max`, typically the
    /// signal the manager already knows about.
    pub fn with_max_signal(max: Signal) -> Self {
        Self {
            sets: RwLock::new(SignalSets {
                max,
                ..Default::default()
            }),
        }
    }

    /// Returns `true` if `raw` holds an identifier absent from max signal.
    pub fn is_novel(&self, raw: &[u32]) -> bool {
        let sets = self.sets.read();
        raw.iter().any(|id| !sets.max.contains(*id))
    }

    /// Adds the part of `raw` that is not yet in max signal to both max and
    /// new signal. Returns the added difference.
    ///
    /// The check and the update happen under one exclusive lock, so when
    /// several workers record the same signal only one of them gets it back.
    pub fn record_novel(&self, raw: &[u32]) -> Signal {
        let mut sets = self.sets.write();
        let diff: Signal = raw
            .iter()
            .copied()
            .filter(|id| !sets.max.contains(*id))
            .collect();
        if diff.is_empty() {
            return diff;
        }
        sets.max.merge(&diff);
        sets.new.merge(&diff);
        diff
    }

    /// The part of `raw` that corpus signal does not cover yet.
    pub fn corpus_diff(&self, raw: &[u32]) -> Signal {
        let sets = self.sets.read();
        raw.iter()
            .copied()
            .filter(|id| !sets.corpus.contains(*id))
            .collect()
    }

    /// Credits `raw` to the corpus. Max signal grows alongside so that corpus
    /// signal stays a subset of it.
    pub fn add_to_corpus(&self, raw: &[u32]) {
        let mut sets = self.sets.write();
        sets.corpus.merge_raw(raw);
        sets.max.merge_raw(raw);
    }

    /// Drains the signal discovered since the previous call.
    pub fn take_new(&self) -> Signal {
        std::mem::take(&mut self.sets.write().new)
    }

    pub fn corpus_len(&self) -> usize {
        self.sets.read().corpus.len()
    }

    pub fn max_len(&self) -> usize {
        self.sets.read().max.len()
    }

    pub fn new_len(&self) -> usize {
        self.sets.read().new.len()
    }

    pub fn corpus_signal(&self) -> Signal {
        self.sets.read().corpus.clone()
    }

    pub fn max_signal(&self) -> Signal {
        self.sets.read().max.clone()
    }

    pub fn new_signal(&self) -> Signal {
        self.sets.read().new.clone()
    }
}
