use crate::env::ExecEnv;
use crate::error::FatalError;
use crate::program::ProgramModel;
use crate::stats::Stat;
use crate::work::WorkSmash;
use crate::worker::{ExecRequest, Worker};
use log::debug;
use std::sync::Arc;

impl<M, E> Worker<M, E>
where
    M: ProgramModel,
    E: ExecEnv<M::Prog>,
{
    /// Explores around a freshly triaged program: fault injection into `call`,
    /// a fixed budget of mutations, then comparison-guided argument
    /// substitution when the environment supports it.
    pub fn smash_input(&mut self, item: WorkSmash<M::Prog>) -> Result<(), FatalError> {
        let fuzzer = Arc::clone(&self.fuzzer);
        if fuzzer.fault_injection_enabled() {
            self.fail_call(&item.prog, item.call)?;
        }

        let corpus = fuzzer.corpus_snapshot();
        for _ in 0..fuzzer.triage_settings().smash_budget {
            let mut prog = item.prog.clone();
            fuzzer.model().mutate(
                &mut prog,
                &mut self.rng,
                fuzzer.program_length(),
                fuzzer.choice_table(),
                &corpus,
            );
            debug!("#{}: smash mutated", self.pid);
            self.execute(fuzzer.exec_opts(), &prog, ExecRequest::default(), Stat::Smash)?;
        }

        if fuzzer.comps_supported() {
            self.execute_hint_seed(&item.prog, item.call)?;
        }
        Ok(())
    }

    /// Injects a fault into `call` at trial 0, 1, 2... until a run completes
    /// without the fault registering, which means the call has no faultable
    /// point left at that depth. Returns the trial index it stopped at, or the
    /// configured cap.
    pub fn fail_call(&mut self, prog: &M::Prog, call: usize) -> Result<usize, FatalError> {
        let cap = self.fuzzer.triage_settings().fault_nth_cap;
        for nth in 0..cap {
            debug!("#{}: injecting fault into call {}/{}", self.pid, call, nth);
            let mut opts = *self.fuzzer.exec_opts();
            opts.flags.inject_fault = true;
            opts.fault_call = call;
            opts.fault_nth = nth;
            let info = self.execute_raw(&opts, prog, Stat::Smash)?;
            let injected = info
                .as_ref()
                .and_then(|info| info.get(call))
                .map(|inf| inf.fault_injected);
            if injected == Some(false) {
                return Ok(nth);
            }
        }
        Ok(cap)
    }

    /// Runs `prog` once collecting comparison operands, then executes every
    /// hint mutant of `call`. Returns the number of mutants executed.
    pub fn execute_hint_seed(&mut self, prog: &M::Prog, call: usize) -> Result<usize, FatalError> {
        debug!("#{}: collecting comparisons", self.pid);
        let fuzzer = Arc::clone(&self.fuzzer);
        let opts = *fuzzer.exec_opts();
        let seed_req = ExecRequest {
            need_comps: true,
            no_collide: true,
            ..Default::default()
        };
        let Some(info) = self.execute(&opts, prog, seed_req, Stat::Seed)? else {
            return Ok(0);
        };
        let Some(comps) = info.into_iter().nth(call).map(|inf| inf.comps) else {
            return Ok(0);
        };

        let mut executed = 0;
        let mut fatal = None;
        fuzzer
            .model()
            .mutate_with_hints(prog, call, &comps, &mut |mutant| {
                if fatal.is_some() {
                    return;
                }
                debug!("#{}: executing comparison hint", self.pid);
                match self.execute(&opts, mutant, ExecRequest::default(), Stat::Hint) {
                    Ok(_) => executed += 1,
                    Err(e) => fatal = Some(e),
                }
            });
        match fatal {
            Some(e) => Err(e),
            None => Ok(executed),
        }
    }
}
