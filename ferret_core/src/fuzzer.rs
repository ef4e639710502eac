use crate::config::{FerretConfig, FuzzerSettings, TriageSettings};
use crate::corpus::{Corpus, CorpusSnapshot, content_hash};
use crate::env::ExecOpts;
use crate::gate::{Gate, kmemleak_scan};
use crate::manager::Manager;
use crate::program::{Program, ProgramModel};
use crate::signal::SignalStore;
use crate::sink::DiagnosticSink;
use crate::stats::Stats;
use crate::work::{WorkCandidate, WorkItem, WorkQueue};
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared fuzzer context: program model, corpus, coverage and the other
/// collaborators a worker needs. Workers hold it behind an `Arc`; every part
/// is internally synchronized.
pub struct Fuzzer<M: ProgramModel> {
    name: String,
    model: M,
    choice_table: M::ChoiceTable,
    exec_opts: ExecOpts,
    work_queue: WorkQueue<M::Prog>,
    corpus: Corpus<M::Prog>,
    signal: SignalStore,
    stats: Stats,
    gate: Gate,
    manager: Arc<dyn Manager>,
    sink: DiagnosticSink,
    settings: FuzzerSettings,
    triage: TriageSettings,
}

impl<M: ProgramModel> Fuzzer<M> {
    /// A context with default settings, no diagnostic output and a gate sized
    /// for a single worker.
    pub fn new(model: M, choice_table: M::ChoiceTable, manager: Arc<dyn Manager>) -> Self {
        let settings = FuzzerSettings::default();
        Self {
            name: settings.name.clone(),
            model,
            choice_table,
            exec_opts: ExecOpts::new(false),
            work_queue: WorkQueue::new(),
            corpus: Corpus::new(),
            signal: SignalStore::new(),
            stats: Stats::new(),
            gate: Gate::new(settings.effective_gate_capacity()),
            manager,
            sink: DiagnosticSink::disabled(),
            settings,
            triage: TriageSettings::default(),
        }
    }

    /// Builds the context described by `config`: gate capacity and leak
    /// checking, diagnostic output, and default execution options.
    pub fn from_config(
        model: M,
        choice_table: M::ChoiceTable,
        manager: Arc<dyn Manager>,
        config: &FerretConfig,
    ) -> Self {
        let settings = config.fuzzer.clone();
        let mut gate = Gate::new(settings.effective_gate_capacity());
        if settings.leak_check {
            gate = gate.with_leak_check(settings.leak_interval, kmemleak_scan);
        }
        let sink = DiagnosticSink::new(settings.output, settings.name.clone())
            .with_dir(settings.output_dir.clone());
        Self {
            name: settings.name.clone(),
            exec_opts: ExecOpts::new(config.executor.collide),
            gate,
            sink,
            triage: config.triage.clone(),
            settings,
            ..Self::new(model, choice_table, manager)
        }
    }

    /// Replaces the fuzzer settings. The reported name follows `settings.name`.
    pub fn with_settings(mut self, settings: FuzzerSettings) -> Self {
        self.name = settings.name.clone();
        self.settings = settings;
        self
    }

    pub fn with_triage_settings(mut self, triage: TriageSettings) -> Self {
        self.triage = triage;
        self
    }

    pub fn with_exec_opts(mut self, opts: ExecOpts) -> Self {
        self.exec_opts = opts;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_sink(mut self, sink: DiagnosticSink) -> Self {
        self.sink = sink;
        self
    }

    /// Starts from an existing signal store, for example one seeded with the
    /// max signal the manager already knows about.
    pub fn with_signal(mut self, signal: SignalStore) -> Self {
        self.signal = signal;
        self
    }

    /// Identity reported to the manager with every new input.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn choice_table(&self) -> &M::ChoiceTable {
        &self.choice_table
    }

    /// Options every execution starts from.
    /// Options every execution starts from.
    pub fn exec_opts(&self) -> &ExecOpts {
        &self.exec_opts
    }

    pub fn work_queue(&self) -> &WorkQueue<M::Prog> {
        &self.work_queue
    }

    pub fn corpus(&self) -> &Corpus<M::Prog> {
        &self.corpus
    }

    /// Current corpus contents, unaffected by later additions.
    pub fn corpus_snapshot(&self) -> CorpusSnapshot<M::Prog> {
        self.corpus.snapshot()
    }

    pub fn signal(&self) -> &SignalStore {
        &self.signal
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn manager(&self) -> &dyn Manager {
        self.manager.as_ref()
    }

    pub fn sink(&self) -> &DiagnosticSink {
        &self.sink
    }

    pub fn settings(&self) -> &FuzzerSettings {
        &self.settings
    }

    pub fn triage_settings(&self) -> &TriageSettings {
        &self.triage
    }

    /// Upper bound on calls in generated and mutated programs.
    pub fn program_length(&self) -> usize {
        self.settings.program_length
    }

    pub fn cover_enabled(&self) -> bool {
        self.settings.cover
    }

    pub fn fault_injection_enabled(&self) -> bool {
        self.settings.fault_injection
    }

    /// Whether the environment can collect comparison operands.
    pub fn comps_supported(&self) -> bool {
        self.settings.comparisons
    }

    /// Appends a triaged program to the local corpus. Returns `false` if a
    /// program with the same hash is already there.
    pub fn add_input_to_corpus(&self, prog: M::Prog, hash: String) -> bool {
        let added = self.corpus.add(prog, hash);
        if !added {
            debug!("Corpus already holds this program, skipping");
        }
        added
    }

    /// Parses seed programs and queues them as candidates. Seeds that fail to
    /// parse or duplicate a corpus entry are skipped. Returns the number
    /// queued.
    pub fn enqueue_seeds(&self, seeds: Vec<(PathBuf, Vec<u8>)>, minimized: bool) -> usize {
        let mut queued = 0;
        for (path, data) in seeds {
            let prog = match self.model.deserialize(&data) {
                Ok(prog) => prog,
                Err(e) => {
                    warn!("Skipping seed {:?}: {:#}", path, e);
                    continue;
                }
            };
            if self.corpus.contains_hash(&content_hash(&prog.serialize())) {
                continue;
            }
            self.work_queue
                .enqueue(WorkItem::Candidate(WorkCandidate { prog, minimized }));
            queued += 1;
        }
        queued
    }
}
