use parking_lot::Mutex;
use std::collections::VecDeque;

/// Provenance flags carried along with a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgFlags {
    /// The program came from the manager already minimized.
    pub minimized: bool,
    /// The program is an externally supplied candidate.
    pub candidate: bool,
}

/// A call produced signal that was not in max signal.
#[derive(Debug, Clone)]
pub struct WorkTriage<P> {
    pub prog: P,
    pub call: usize,
    /// Raw signal of `call` at the execution that flagged it.
    pub signal: Vec<u32>,
    pub flags: ProgFlags,
}

/// A program from outside (seed corpus, manager) to run as is.
#[derive(Debug, Clone)]
pub struct WorkCandidate<P> {
    pub prog: P,
    pub minimized: bool,
}

/// A freshly triaged program to explore aggressively around `call`.
#[derive(Debug, Clone)]
pub struct WorkSmash<P> {
    pub prog: P,
    pub call: usize,
}

/// A unit of deferred work, produced by the novelty hook, by triage and by
/// seed loading.
#[derive(Debug, Clone)]
pub enum WorkItem<P> {
    Triage(WorkTriage<P>),
    Candidate(WorkCandidate<P>),
    Smash(WorkSmash<P>),
}

/// Queue class of an item, in dequeue priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkKind {
    TriageCandidate,
    Candidate,
    Triage,
    Smash,
}

impl<P> WorkItem<P> {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkItem::Triage(t) if t.flags.candidate => WorkKind::TriageCandidate,
            WorkItem::Triage(_) => WorkKind::Triage,
            WorkItem::Candidate(_) => WorkKind::Candidate,
            WorkItem::Smash(_) => WorkKind::Smash,
        }
    }
}

#[derive(Debug)]
struct Queues<P> {
    triage_candidate: VecDeque<WorkTriage<P>>,
    candidate: VecDeque<WorkCandidate<P>>,
    triage: VecDeque<WorkTriage<P>>,
    smash: VecDeque<WorkSmash<P>>,
}

impl<P> Default for Queues<P> {
    fn default() -> Self {
        Self {
            triage_candidate: VecDeque::new(),
            candidate: VecDeque::new(),
            triage: VecDeque::new(),
            smash: VecDeque::new(),
        }
    }
}

/// Multi-producer, multi-consumer priority queue of work items.
///
/// Triage of candidates comes out first, then candidates, then regular
/// triage, then smash. Within one class items keep insertion order.
#[derive(Debug)]
pub struct WorkQueue<P> {
    queues: Mutex<Queues<P>>,
}

impl<P> Default for WorkQueue<P> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
        }
    }
}

impl<P> WorkQueue<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: WorkItem<P>) {
        let mut q = self.queues.lock();
        match item {
            WorkItem::Triage(t) if t.flags.candidate => q.triage_candidate.push_back(t),
            WorkItem::Triage(t) => q.triage.push_back(t),
            WorkItem::Candidate(c) => q.candidate.push_back(c),
            WorkItem::Smash(s) => q.smash.push_back(s),
        }
    }

    /// Non-blocking poll for the highest-priority item.
    pub fn dequeue(&self) -> Option<WorkItem<P>> {
        let mut q = self.queues.lock();
        if let Some(t) = q.triage_candidate.pop_front() {
            return Some(WorkItem::Triage(t));
        }
        if let Some(c) = q.candidate.pop_front() {
            return Some(WorkItem::Candidate(c));
        }
        if let Some(t) = q.triage.pop_front() {
            return Some(WorkItem::Triage(t));
        }
        q.smash.pop_front().map(WorkItem::Smash)
    }

    pub fn len(&self) -> usize {
        let q = self.queues.lock();
        q.triage_candidate.len() + q.candidate.len() + q.triage.len() + q.smash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, kind: WorkKind) -> usize {
        let q = self.queues.lock();
        match kind {
            WorkKind::TriageCandidate => q.triage_candidate.len(),
            WorkKind::Candidate => q.candidate.len(),
            WorkKind::Triage => q.triage.len(),
            WorkKind::Smash => q.smash.len(),
        }
    }
}
