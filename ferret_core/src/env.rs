use crate::program::Program;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Comparison operands captured during execution: each operand maps to the
/// set of values it was compared against.
pub type CompMap = BTreeMap<u64, BTreeSet<u64>>;

/// What the environment should collect and do during one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecFlags {
    /// Deduplicate coverage inside the environment.
    pub dedup_cover: bool,
    /// Collect per-call cover, not just signal.
    pub collect_cover: bool,
    /// Collect comparison operands.
    pub collect_comps: bool,
    /// Run calls in collide mode.
    pub collide: bool,
    /// Inject a fault into `fault_call` at trial `fault_nth`.
    pub inject_fault: bool,
}

/// Options for one execution. Displays as the ` (fault-call:C fault-nth:N)`
/// suffix of diagnostic headers when fault injection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOpts {
    pub flags: ExecFlags,
    pub fault_call: usize,
    pub fault_nth: usize,
}

impl ExecOpts {
    /// Options every worker starts from: deduplicated signal, no cover.
    pub fn new(collide: bool) -> Self {
        Self {
            flags: ExecFlags {
                dedup_cover: true,
                collide,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl fmt::Display for ExecOpts {
    /// Fault target, or nothing when fault injection is off.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.inject_fault {
            write!(
                f,
                " (fault-call:{} fault-nth:{})",
                self.fault_call, self.fault_nth
            )
        } else {
            Ok(())
        }
    }
}

/// Raw results for one call. A call that did not execute has empty signal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallInfo {
    pub signal: Vec<u32>,
    pub cover: Vec<u32>,
    pub comps: CompMap,
    pub fault_injected: bool,
}

/// Everything one execution reported back.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub output: Vec<u8>,
    pub info: Vec<CallInfo>,
    /// The environment recognized a target bug in the output.
    pub failed: bool,
    pub hanged: bool,
}

/// Failure to execute at all, as opposed to the target misbehaving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// The executor itself broke in a way retrying will not fix.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),
    /// The environment hiccuped (resource exhaustion, lost channel...).
    #[error("environment error: {0}")]
    Transient(String),
}

/// Runs programs in the target. One instance per worker.
///
/// The environment runs one program and reports raw per-call results. How it
/// isolates the target is up to the implementation.
pub trait ExecEnv<P: Program>: Send {
    fn exec(&mut self, opts: &ExecOpts, prog: &P) -> Result<ExecOutcome, EnvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_request_dedup_signal_only() {
        let opts = ExecOpts::new(true);
        assert!(opts.flags.dedup_cover);
        assert!(opts.flags.collide);
        assert!(!opts.flags.collect_cover);
        assert!(!opts.flags.inject_fault);
    }

    #[test]
    fn display_describes_fault_target_only_when_injecting() {
        let mut opts = ExecOpts::new(false);
        assert_eq!(opts.to_string(), "");
        opts.flags.inject_fault = true;
        opts.fault_call = 2;
        opts.fault_nth = 7;
        assert_eq!(opts.to_string(), " (fault-call:2 fault-nth:7)");
    }
}
