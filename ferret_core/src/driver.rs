use crate::env::{CallInfo, EnvError, ExecEnv, ExecOpts};
use crate::error::FatalError;
use crate::fuzzer::Fuzzer;
use crate::program::ProgramModel;
use crate::stats::Stat;
use log::{debug, error, trace};
use std::time::Duration;

/// Runs programs through one worker's execution environment.
///
/// Transient environment failures are retried after a backoff. A run that
/// keeps failing past `max_retries`, or fails in a way marked non-retryable,
/// is fatal for the worker.
pub struct ExecDriver<E> {
    pid: usize,
    env: E,
    max_retries: u32,
    backoff: Duration,
}

impl<E> ExecDriver<E> {
    pub fn new(pid: usize, env: E) -> Self {
        Self {
            pid,
            env,
            max_retries: crate::config::default_max_retries(),
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Executes `prog` once, counting every attempt under `stat`.
    ///
    /// Returns `Ok(None)` when the environment recognized a target bug in the
    /// output: such a run carries no coverage and must not reach the corpus.
    pub fn run<M>(
        &mut self,
        fuzzer: &Fuzzer<M>,
        opts: &ExecOpts,
        prog: &M::Prog,
        stat: Stat,
    ) -> Result<Option<Vec<CallInfo>>, FatalError>
    where
        M: ProgramModel,
        E: ExecEnv<M::Prog>,
    {
        if !opts.flags.dedup_cover {
            return Err(FatalError::Invariant(
                "dedup cover is not enabled".to_string(),
            ));
        }

        let _ticket = fuzzer.gate().enter();
        fuzzer.sink().mirror(self.pid, opts, prog);

        let mut attempt: u32 = 0;
        loop {
            fuzzer.stats().inc(stat);
            match self.env.exec(opts, prog) {
                Ok(outcome) if outcome.failed => {
                    error!(
                        "BUG: executor-detected bug:\n{}",
                        String::from_utf8_lossy(&outcome.output)
                    );
                    return Ok(None);
                }
                Ok(outcome) => {
                    debug!(
                        "#{}: result failed={} hanged={}: {}",
                        self.pid,
                        outcome.failed,
                        outcome.hanged,
                        String::from_utf8_lossy(&outcome.output)
                    );
                    return Ok(Some(outcome.info));
                }
                Err(EnvError::ExecutorFailure(msg)) => {
                    return Err(FatalError::ExecutorFailure(msg));
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(FatalError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                    attempt += 1;
                    trace!(
                        "#{}: executor failure='{}', retrying #{}",
                        self.pid,
                        err,
                        attempt + 1
                    );
                    std::thread::sleep(self.backoff);
                }
            }
        }
    }
}
