use crate::env::{CallInfo, EnvError, ExecEnv, ExecOpts, ExecOutcome};
use crate::manager::{Manager, ManagerError, NewInputArgs};
use crate::program::Program;
use std::collections::VecDeque;

/// Environment replaying a fixed script of results. Once the script runs out
/// it returns the fallback, or a run in which no call executed.
#[derive(Debug, Default)]
pub struct ScriptedEnv {
    script: VecDeque<Result<ExecOutcome, EnvError>>,
    fallback: Option<Result<ExecOutcome, EnvError>>,
    seen: Vec<ExecOpts>,
}

impl ScriptedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, result: Result<ExecOutcome, EnvError>) -> Self {
        self.script.push_back(result);
        self
    }

    pub fn otherwise(mut self, result: Result<ExecOutcome, EnvError>) -> Self {
        self.fallback = Some(result);
        self
    }

    pub fn executions(&self) -> usize {
        self.seen.len()
    }

    /// Options of every execution, in order.
    pub fn seen(&self) -> &[ExecOpts] {
        &self.seen
    }
}

impl<P: Program> ExecEnv<P> for ScriptedEnv {
    fn exec(&mut self, opts: &ExecOpts, _prog: &P) -> Result<ExecOutcome, EnvError> {
        self.seen.push(*opts);
        match self.script.pop_front() {
            Some(result) => result,
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Ok(ExecOutcome::default())),
        }
    }
}

/// A successful run where call `i` produced `signals[i]`, with cover mirroring
/// the signal.
pub fn info_with_signal(signals: &[&[u32]]) -> ExecOutcome {
    ExecOutcome {
        info: signals
            .iter()
            .map(|s| CallInfo {
                signal: s.to_vec(),
                cover: s.iter().map(|id| id + 0x1000).collect(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Manager whose every call fails.
#[derive(Debug, Default)]
pub struct FailingManager;

impl Manager for FailingManager {
    fn new_input(&self, _args: NewInputArgs) -> Result<(), ManagerError> {
        Err(ManagerError::Rejected("connection reset by peer".into()))
    }
}
