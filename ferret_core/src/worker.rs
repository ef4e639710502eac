use crate::driver::ExecDriver;
use crate::env::{CallInfo, ExecEnv, ExecOpts};
use crate::error::FatalError;
use crate::fuzzer::Fuzzer;
use crate::program::ProgramModel;
use crate::stats::Stat;
use crate::work::{ProgFlags, WorkItem, WorkKind, WorkTriage};
use log::{debug, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Adjustments to the default options for one execution, plus the flags that
/// triage items spawned by it inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub need_comps: bool,
    pub no_collide: bool,
    pub flags: ProgFlags,
}

/// Path taken by one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Work(WorkKind),
    Generate,
    Fuzz,
}

/// One fuzzing loop with its own execution environment and generator.
///
/// Each iteration first polls the shared work queue. With nothing queued the
/// worker either generates a fresh program or mutates one picked from the
/// corpus. Every execution that goes through [`Worker::execute`] feeds the
/// novelty hook, which queues triage for calls that produced unseen signal.
pub struct Worker<M: ProgramModel, E> {
    pub(crate) fuzzer: Arc<Fuzzer<M>>,
    pub(crate) pid: usize,
    pub(crate) driver: ExecDriver<E>,
    pub(crate) rng: ChaCha8Rng,
}

fn time_seed(pid: usize) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos.wrapping_add((pid as u64).wrapping_mul(1_000_000_000_000))
}

impl<M, E> Worker<M, E>
where
    M: ProgramModel,
    E: ExecEnv<M::Prog>,
{
    /// Creates worker `pid`, seeding its generator from the clock and `pid`
    /// so that workers started together do not walk the same sequence.
    pub fn new(fuzzer: Arc<Fuzzer<M>>, pid: usize, env: E) -> Self {
        Self::with_seed(fuzzer, pid, env, time_seed(pid))
    }

    /// Creates a worker with a fixed generator seed, for reproducible runs.
    pub fn with_seed(fuzzer: Arc<Fuzzer<M>>, pid: usize, env: E, seed: u64) -> Self {
        Self {
            fuzzer,
            pid,
            driver: ExecDriver::new(pid, env),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.driver = self.driver.with_retry_policy(max_retries, backoff);
        self
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn fuzzer(&self) -> &Arc<Fuzzer<M>> {
        &self.fuzzer
    }

    pub fn driver(&self) -> &ExecDriver<E> {
        &self.driver
    }

    /// Loops until a fatal error.
    pub fn run(&mut self) -> Result<(), FatalError> {
        let mut i: u64 = 0;
        loop {
            self.step(i)?;
            i = i.wrapping_add(1);
        }
    }

    /// Runs `iterations` loop iterations, stopping early on a fatal error.
    pub fn run_for(&mut self, iterations: u64) -> Result<(), FatalError> {
        for i in 0..iterations {
            self.step(i)?;
        }
        Ok(())
    }

    /// Runs iteration `i` of the loop.
    pub fn step(&mut self, i: u64) -> Result<Step, FatalError> {
        if let Some(item) = self.fuzzer.work_queue().dequeue() {
            let kind = item.kind();
            self.dispatch(item)?;
            return Ok(Step::Work(kind));
        }

        let fuzzer = Arc::clone(&self.fuzzer);
        let corpus = fuzzer.corpus_snapshot();
        let period = fuzzer.triage_settings().generate_period;
        if corpus.is_empty() || (period != 0 && i % period == 0) {
            let prog = fuzzer.model().generate(
                &mut self.rng,
                fuzzer.program_length(),
                fuzzer.choice_table(),
            );
            debug!("#{}: generated", self.pid);
            self.execute(fuzzer.exec_opts(), &prog, ExecRequest::default(), Stat::Generate)?;
            Ok(Step::Generate)
        } else {
            let mut prog = corpus[self.rng.random_range(0..corpus.len())]
                .as_ref()
                .clone();
            fuzzer.model().mutate(
                &mut prog,
                &mut self.rng,
                fuzzer.program_length(),
                fuzzer.choice_table(),
                &corpus,
            );
            debug!("#{}: mutated", self.pid);
            self.execute(fuzzer.exec_opts(), &prog, ExecRequest::default(), Stat::Fuzz)?;
            Ok(Step::Fuzz)
        }
    }

    fn dispatch(&mut self, item: WorkItem<M::Prog>) -> Result<(), FatalError> {
        match item {
            WorkItem::Triage(item) => {
                self.triage_input(item)?;
            }
            WorkItem::Candidate(item) => {
                let fuzzer = Arc::clone(&self.fuzzer);
                let req = ExecRequest {
                    flags: ProgFlags {
                        minimized: item.minimized,
                        candidate: true,
                    },
                    ..Default::default()
                };
                self.execute(fuzzer.exec_opts(), &item.prog, req, Stat::Candidate)?;
            }
            WorkItem::Smash(item) => self.smash_input(item)?,
        }
        Ok(())
    }

    /// Executes `prog` and queues triage for every call whose signal is not
    /// yet in max signal.
    pub fn execute(
        &mut self,
        opts: &ExecOpts,
        prog: &M::Prog,
        req: ExecRequest,
        stat: Stat,
    ) -> Result<Option<Vec<CallInfo>>, FatalError> {
        let mut opts = *opts;
        if req.need_comps {
            if !self.fuzzer.comps_supported() {
                return Err(FatalError::Invariant(
                    "comparison collection requested but not supported".to_string(),
                ));
            }
            opts.flags.collect_comps = true;
        }
        if req.no_collide {
            opts.flags.collide = false;
        }

        let Some(info) = self.execute_raw(&opts, prog, stat)? else {
            return Ok(None);
        };
        if !self.fuzzer.cover_enabled() {
            return Ok(Some(info));
        }

        let signal = self.fuzzer.signal();
        for (call, inf) in info.iter().enumerate() {
            if !signal.is_novel(&inf.signal) {
                continue;
            }
            let diff = signal.record_novel(&inf.signal);
            if diff.is_empty() {
                // Another worker recorded it first.
                continue;
            }
            trace!(
                "#{}: call {} produced {} new signal",
                self.pid,
                call,
                diff.len()
            );
            self.fuzzer.work_queue().enqueue(WorkItem::Triage(WorkTriage {
                prog: prog.clone(),
                call,
                signal: inf.signal.clone(),
                flags: req.flags,
            }));
        }
        Ok(Some(info))
    }

    /// Executes `prog` with exactly `opts`, bypassing the novelty hook.
    pub fn execute_raw(
        &mut self,
        opts: &ExecOpts,
        prog: &M::Prog,
        stat: Stat,
    ) -> Result<Option<Vec<CallInfo>>, FatalError> {
        self.driver.run(&self.fuzzer, opts, prog, stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FuzzerSettings, SimSettings, TriageSettings};
    use crate::corpus::content_hash;
    use crate::manager::InMemoryManager;
    use crate::program::Program;
    use crate::sim::{SimChoiceTable, SimEnv, SimModel, SimProgram};
    use crate::testing::{ScriptedEnv, info_with_signal};
    use crate::work::{WorkCandidate, WorkSmash};

    fn fuzzer() -> Arc<Fuzzer<SimModel>> {
        Arc::new(Fuzzer::new(
            SimModel::new(),
            SimChoiceTable::uniform(),
            Arc::new(InMemoryManager::new()),
        ))
    }

    fn seed_corpus(fuzzer: &Fuzzer<SimModel>) {
        let prog = SimProgram::parse("open(0x1, 0x2)\nclose(0x3)\n").unwrap();
        fuzzer.add_input_to_corpus(prog.clone(), content_hash(&prog.serialize()));
    }

    #[test]
    fn empty_corpus_generates_at_iteration_zero() {
        let fuzzer = fuzzer();
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, ScriptedEnv::new(), 1);
        assert_eq!(worker.step(0).unwrap(), Step::Generate);
        assert_eq!(fuzzer.stats().get(Stat::Generate), 1);
    }

    #[test]
    fn empty_corpus_generates_off_cadence_too() {
        let mut worker = Worker::with_seed(fuzzer(), 0, ScriptedEnv::new(), 1);
        assert_eq!(worker.step(37).unwrap(), Step::Generate);
    }

    #[test]
    fn non_empty_corpus_mutates_between_generation_rounds() {
        let fuzzer = fuzzer();
        seed_corpus(&fuzzer);
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, ScriptedEnv::new(), 1);
        assert_eq!(worker.step(7).unwrap(), Step::Fuzz);
        assert_eq!(worker.step(99).unwrap(), Step::Fuzz);
        assert_eq!(worker.step(100).unwrap(), Step::Generate);
        assert_eq!(fuzzer.stats().get(Stat::Fuzz), 2);
    }

    #[test]
    fn queued_work_is_taken_first() {
        let fuzzer = fuzzer();
        let prog = SimProgram::parse("close(0x3)\n").unwrap();
        fuzzer.work_queue().enqueue(WorkItem::Candidate(WorkCandidate {
            prog: prog.clone(),
            minimized: true,
        }));
        let env = ScriptedEnv::new().then(Ok(info_with_signal(&[&[10, 11]])));
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, env, 1);
        assert_eq!(worker.step(0).unwrap(), Step::Work(WorkKind::Candidate));
        assert_eq!(fuzzer.stats().get(Stat::Candidate), 1);

        let Some(WorkItem::Triage(item)) = fuzzer.work_queue().dequeue() else {
            panic!("expected a triage item");
        };
        assert_eq!(item.prog, prog);
        assert_eq!(item.signal, vec![10, 11]);
        assert_eq!(
            item.flags,
            ProgFlags {
                minimized: true,
                candidate: true
            }
        );
    }

    #[test]
    fn novelty_hook_queues_each_new_call_once() {
        let fuzzer = fuzzer();
        let prog = SimProgram::parse("open(0x1, 0x2)\nclose(0x3)\n").unwrap();
        let env = ScriptedEnv::new()
            .then(Ok(info_with_signal(&[&[1, 2], &[3]])))
            .then(Ok(info_with_signal(&[&[1, 2], &[3, 4]])));
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, env, 1);
        let opts = *fuzzer.exec_opts();

        worker
            .execute(&opts, &prog, ExecRequest::default(), Stat::Fuzz)
            .unwrap();
        assert_eq!(fuzzer.work_queue().len_of(WorkKind::Triage), 2);
        assert_eq!(fuzzer.signal().max_len(), 3);

        worker
            .execute(&opts, &prog, ExecRequest::default(), Stat::Fuzz)
            .unwrap();
        assert_eq!(fuzzer.work_queue().len_of(WorkKind::Triage), 3);
        assert_eq!(fuzzer.signal().new_len(), 4);
        assert_eq!(fuzzer.signal().corpus_len(), 0);
    }

    #[test]
    fn execute_raw_skips_novelty_hook() {
        let fuzzer = fuzzer();
        let prog = SimProgram::parse("close(0x3)\n").unwrap();
        let env = ScriptedEnv::new().then(Ok(info_with_signal(&[&[1]])));
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, env, 1);
        let opts = *fuzzer.exec_opts();
        worker.execute_raw(&opts, &prog, Stat::Triage).unwrap();
        assert!(fuzzer.work_queue().is_empty());
        assert_eq!(fuzzer.signal().max_len(), 0);
    }

    #[test]
    fn request_adjusts_options() {
        let fuzzer = Arc::new(
            Fuzzer::new(
                SimModel::new(),
                SimChoiceTable::uniform(),
                Arc::new(InMemoryManager::new()),
            )
            .with_settings(FuzzerSettings {
                comparisons: true,
                ..Default::default()
            })
            .with_exec_opts(ExecOpts::new(true)),
        );
        let prog = SimProgram::parse("close(0x3)\n").unwrap();
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, ScriptedEnv::new(), 1);
        let opts = *fuzzer.exec_opts();
        let req = ExecRequest {
            need_comps: true,
            no_collide: true,
            ..Default::default()
        };
        worker.execute(&opts, &prog, req, Stat::Seed).unwrap();
        let seen = worker.driver().env().seen()[0];
        assert!(seen.flags.collect_comps);
        assert!(!seen.flags.collide);
    }

    #[test]
    fn comparisons_without_support_are_an_invariant_violation() {
        let fuzzer = fuzzer();
        let prog = SimProgram::parse("close(0x3)\n").unwrap();
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, ScriptedEnv::new(), 1);
        let opts = *fuzzer.exec_opts();
        let req = ExecRequest {
            need_comps: true,
            ..Default::default()
        };
        let err = worker.execute(&opts, &prog, req, Stat::Seed).unwrap_err();
        assert!(matches!(err, FatalError::Invariant(_)));
    }

    #[test]
    fn disabled_cover_skips_novelty_hook() {
        let fuzzer = Arc::new(
            Fuzzer::new(
                SimModel::new(),
                SimChoiceTable::uniform(),
                Arc::new(InMemoryManager::new()),
            )
            .with_settings(FuzzerSettings {
                cover: false,
                ..Default::default()
            }),
        );
        let env = ScriptedEnv::new().then(Ok(info_with_signal(&[&[1]])));
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, env, 1);
        assert_eq!(worker.step(0).unwrap(), Step::Generate);
        assert!(fuzzer.work_queue().is_empty());
    }

    #[test]
    fn smash_items_are_dispatched() {
        let fuzzer = Arc::new(
            Fuzzer::new(
                SimModel::new(),
                SimChoiceTable::uniform(),
                Arc::new(InMemoryManager::new()),
            )
            .with_triage_settings(TriageSettings {
                smash_budget: 4,
                ..Default::default()
            }),
        );
        let prog = SimProgram::parse("close(0x3)\n").unwrap();
        fuzzer
            .work_queue()
            .enqueue(WorkItem::Smash(WorkSmash { prog, call: 0 }));
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, ScriptedEnv::new(), 1);
        assert_eq!(worker.step(0).unwrap(), Step::Work(WorkKind::Smash));
        assert_eq!(fuzzer.stats().get(Stat::Smash), 4);
    }

    #[test]
    fn simulated_run_builds_a_corpus() {
        let manager = Arc::new(InMemoryManager::new());
        let fuzzer = Arc::new(
            Fuzzer::new(SimModel::new(), SimChoiceTable::uniform(), manager.clone())
                .with_settings(FuzzerSettings {
                    program_length: 5,
                    comparisons: true,
                    fault_injection: true,
                    ..Default::default()
                })
                .with_triage_settings(TriageSettings {
                    smash_budget: 5,
                    fault_nth_cap: 10,
                    ..Default::default()
                }),
        );
        let env = SimEnv::new(&SimSettings::default());
        let mut worker = Worker::with_seed(fuzzer.clone(), 0, env, 42);
        worker.run_for(200).unwrap();

        assert!(!fuzzer.corpus().is_empty());
        assert!(manager.len() >= fuzzer.corpus().len());
        let corpus = fuzzer.signal().corpus_signal();
        assert!(fuzzer.signal().max_signal().is_superset(&corpus));
        for input in manager.inputs() {
            assert!(SimModel.deserialize(&input.input.prog).is_ok());
            assert!(!input.input.signal.is_empty());
        }
    }
}
