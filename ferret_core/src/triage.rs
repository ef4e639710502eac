use crate::corpus::content_hash;
use crate::env::{ExecEnv, ExecOpts};
use crate::error::FatalError;
use crate::manager::{NewInputArgs, RpcInput};
use crate::program::{Program, ProgramModel};
use crate::signal::{Cover, Signal, cover_union};
use crate::stats::Stat;
use crate::work::{WorkItem, WorkSmash, WorkTriage};
use crate::worker::{ExecRequest, Worker};
use log::{debug, trace};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriageOutcome {
    /// Corpus signal already covers everything the item found.
    Redundant,
    /// The new signal did not reproduce, or the call kept failing to run.
    Flaky,
    /// Reported to the manager and added to the local corpus.
    Reported {
        hash: String,
        /// Index of the triaged call in the reported program.
        call: usize,
    },
}

impl<M, E> Worker<M, E>
where
    M: ProgramModel,
    E: ExecEnv<M::Prog>,
{
    /// Confirms that the item's new signal is real, shrinks the program that
    /// produces it, reports it to the manager and adds it to the corpus.
    /// Items that are not already minimized are queued for smashing.
    pub fn triage_input(
        &mut self,
        item: WorkTriage<M::Prog>,
    ) -> Result<TriageOutcome, FatalError> {
        debug!(
            "#{}: triaging minimized={} candidate={}",
            self.pid, item.flags.minimized, item.flags.candidate
        );
        let fuzzer = Arc::clone(&self.fuzzer);
        if !fuzzer.cover_enabled() {
            return Err(FatalError::Invariant(
                "triage requires coverage collection".to_string(),
            ));
        }

        let novel = fuzzer.signal().corpus_diff(&item.signal);
        if novel.is_empty() {
            return Ok(TriageOutcome::Redundant);
        }
        let call_name = item
            .prog
            .call_name(item.call)
            .unwrap_or("<unknown>")
            .to_string();
        trace!(
            "triaging input for {} (new signal={})",
            call_name,
            novel.len()
        );

        let mut opts = *fuzzer.exec_opts();
        opts.flags.collect_cover = true;
        opts.flags.collide = false;

        let mut prog = item.prog;
        let mut call = item.call;
        let input_cover = if item.flags.minimized {
            self.harvest_cover(&opts, &prog, call)?
        } else {
            let Some((novel, cover)) = self.deflake(&opts, &prog, call, novel)? else {
                return Ok(TriageOutcome::Flaky);
            };
            (prog, call) = self.minimize_input(&prog, call, &novel)?;
            cover
        };

        let data = prog.serialize();
        let hash = content_hash(&data);
        debug!(
            "added new input for {} to corpus:\n{}",
            call_name,
            String::from_utf8_lossy(&data)
        );
        fuzzer.manager().new_input(NewInputArgs {
            name: fuzzer.name().to_string(),
            input: RpcInput {
                call: call_name,
                prog: data,
                signal: Signal::canonicalize(&item.signal).into_vec(),
                cover: input_cover,
            },
        })?;

        fuzzer.signal().add_to_corpus(&item.signal);
        fuzzer.add_input_to_corpus(prog.clone(), hash.clone());

        if !item.flags.minimized {
            fuzzer
                .work_queue()
                .enqueue(WorkItem::Smash(WorkSmash { prog, call }));
        }
        Ok(TriageOutcome::Reported { hash, call })
    }

    /// Runs an already minimized program until the call yields cover. A call
    /// that never runs just leaves the cover empty.
    fn harvest_cover(
        &mut self,
        opts: &ExecOpts,
        prog: &M::Prog,
        call: usize,
    ) -> Result<Cover, FatalError> {
        let attempts = self.fuzzer.triage_settings().attempts;
        for _ in 0..attempts {
            let info = self.execute_raw(opts, prog, Stat::Triage)?;
            match info.as_ref().and_then(|info| info.get(call)) {
                Some(inf) if !inf.cover.is_empty() => return Ok(inf.cover.clone()),
                _ => continue,
            }
        }
        Ok(Cover::new())
    }

    /// Narrows `novel` to the part that every run reproduces and collects
    /// the union of cover. `None` means the item is not worth keeping.
    fn deflake(
        &mut self,
        opts: &ExecOpts,
        prog: &M::Prog,
        call: usize,
        mut novel: Signal,
    ) -> Result<Option<(Signal, Cover)>, FatalError> {
        let settings = self.fuzzer.triage_settings().clone();
        let mut not_executed = 0;
        let mut cover = Cover::new();
        for _ in 0..settings.attempts {
            let info = self.execute_raw(opts, prog, Stat::Triage)?;
            let executed = info
                .as_ref()
                .and_then(|info| info.get(call))
                .filter(|inf| !inf.signal.is_empty());
            let Some(inf) = executed else {
                not_executed += 1;
                if not_executed > settings.not_executed_tolerance {
                    debug!("#{}: call {} did not execute, giving up", self.pid, call);
                    return Ok(None);
                }
                continue;
            };
            novel = novel.intersection(&Signal::canonicalize(&inf.signal));
            if novel.is_empty() {
                debug!("#{}: new signal of call {} is flaky", self.pid, call);
                return Ok(None);
            }
            cover = if cover.is_empty() {
                inf.cover.clone()
            } else {
                cover_union(&cover, &inf.cover)
            };
        }
        Ok(Some((novel, cover)))
    }

    /// Minimizes `prog` around `call`, keeping only reductions under which the
    /// call still produces all of `novel`.
    fn minimize_input(
        &mut self,
        prog: &M::Prog,
        call: usize,
        novel: &Signal,
    ) -> Result<(M::Prog, usize), FatalError> {
        let fuzzer = Arc::clone(&self.fuzzer);
        let opts = *fuzzer.exec_opts();
        let req = ExecRequest {
            no_collide: true,
            ..Default::default()
        };
        let mut fatal = None;
        let minimized = fuzzer.model().minimize(
            prog,
            call,
            &mut |candidate, candidate_call| {
                if fatal.is_some() {
                    return false;
                }
                match self.execute(&opts, candidate, req, Stat::Minimize) {
                    Ok(info) => info
                        .as_ref()
                        .and_then(|info| info.get(candidate_call))
                        .filter(|inf| !inf.signal.is_empty())
                        .is_some_and(|inf| Signal::canonicalize(&inf.signal).is_superset(novel)),
                    Err(e) => {
                        fatal = Some(e);
                        false
                    }
                }
            },
            false,
        );
        match fatal {
            Some(e) => Err(e),
            None => Ok(minimized),
        }
    }
}
