use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What an execution was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stat {
    Generate,
    Fuzz,
    Candidate,
    Triage,
    Minimize,
    Smash,
    Hint,
    Seed,
}

impl Stat {
    pub const ALL: [Stat; 8] = [
        Stat::Generate,
        Stat::Fuzz,
        Stat::Candidate,
        Stat::Triage,
        Stat::Minimize,
        Stat::Smash,
        Stat::Hint,
        Stat::Seed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stat::Generate => "exec gen",
            Stat::Fuzz => "exec fuzz",
            Stat::Candidate => "exec candidate",
            Stat::Triage => "exec triage",
            Stat::Minimize => "exec minimize",
            Stat::Smash => "exec smash",
            Stat::Hint => "exec hints",
            Stat::Seed => "exec seeds",
        }
    }
}

/// Execution counters shared by all workers.
#[derive(Debug, Default)]
pub struct Stats {
    counters: [AtomicU64; Stat::ALL.len()],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, stat: Stat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        Stat::ALL.iter().map(|&s| self.get(s)).sum()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot(Stat::ALL.iter().map(|&s| (s, self.get(s))).collect())
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot(BTreeMap<Stat, u64>);

impl StatsSnapshot {
    pub fn get(&self, stat: Stat) -> u64 {
        self.0.get(&stat).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (stat, count) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}: {}", stat.name(), count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counters_are_independent() {
        let stats = Stats::new();
        stats.inc(Stat::Fuzz);
        stats.inc(Stat::Fuzz);
        stats.inc(Stat::Hint);
        assert_eq!(stats.get(Stat::Fuzz), 2);
        assert_eq!(stats.get(Stat::Hint), 1);
        assert_eq!(stats.get(Stat::Generate), 0);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inc(Stat::Smash);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.get(Stat::Smash), 4000);
    }

    #[test]
    fn snapshot_lists_every_counter() {
        let stats = Stats::new();
        stats.inc(Stat::Seed);
        let snap = stats.snapshot();
        assert_eq!(snap.get(Stat::Seed), 1);
        assert_eq!(snap.total(), 1);
        let text = snap.to_string();
        assert!(text.starts_with("exec gen: 0"));
        assert!(text.contains("exec seeds: 1"));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"seed\":1"));
    }
}
