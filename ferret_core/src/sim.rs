use crate::config::SimSettings;
use crate::env::{CallInfo, CompMap, EnvError, ExecEnv, ExecOpts, ExecOutcome};
use crate::program::{Program, ProgramModel};
use anyhow::{Context, bail};
use rand::Rng;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// Name and argument count of every simulated call.
pub const SYSCALLS: &[(&str, usize)] = &[
    ("open", 2),
    ("read", 3),
    ("write", 3),
    ("close", 1),
    ("mmap", 4),
    ("ioctl", 3),
    ("socket", 3),
    ("bind", 2),
];

/// Constants the simulated target compares arguments against. Hitting one
/// unlocks extra coverage in the call.
const MAGIC: &[u64] = &[0xdead, 0x1337, 0xfeed_face, 0x4000, 0x7f00_0001];

const INTERESTING: &[u64] = &[0, 1, 2, 0x7f, 0xff, 0x1000, 0xffff_ffff, u64::MAX];

/// One call of a [`SimProgram`]: an index into the call table plus its
/// integer arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    /// Index into [`SYSCALLS`].
    pub id: usize,
    pub args: Vec<u64>,
}

impl SimCall {
    pub fn name(&self) -> &'static str {
        SYSCALLS[self.id].0
    }
}

/// A sequence of simulated calls. Serialized one call per line as
/// `name(0x1, 0x2)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimProgram {
    pub calls: Vec<SimCall>,
}

impl SimProgram {
    pub fn new(calls: Vec<SimCall>) -> Self {
        Self { calls }
    }

    /// Parses the text form produced by [`Program::serialize`]: one
    /// `name(0x1, 0x2)` call per line. Blank lines and `#` comments are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, anyhow::Error> {
        let mut calls = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, rest) = line
                .split_once('(')
                .with_context(|| format!("line {}: missing '('", lineno + 1))?;
            let Some(args_str) = rest.strip_suffix(')') else {
                bail!("line {}: missing ')'", lineno + 1);
            };
            let Some(id) = SYSCALLS.iter().position(|(n, _)| *n == name.trim()) else {
                bail!("line {}: unknown call '{}'", lineno + 1, name.trim());
            };
            let args = args_str
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(parse_arg)
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("line {}: bad argument", lineno + 1))?;
            if args.len() != SYSCALLS[id].1 {
                bail!(
                    "line {}: {} takes {} arguments, got {}",
                    lineno + 1,
                    SYSCALLS[id].0,
                    SYSCALLS[id].1,
                    args.len()
                );
            }
            calls.push(SimCall { id, args });
        }
        Ok(Self { calls })
    }
}

fn parse_arg(arg: &str) -> Result<u64, std::num::ParseIntError> {
    match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    }
}

impl Program for SimProgram {
    fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for call in &self.calls {
            let args: Vec<String> = call.args.iter().map(|a| format!("{a:#x}")).collect();
            let _ = writeln!(out, "{}({})", call.name(), args.join(", "));
        }
        out.into_bytes()
    }

    fn len(&self) -> usize {
        self.calls.len()
    }

    fn call_name(&self, idx: usize) -> Option<&str> {
        self.calls.get(idx).map(SimCall::name)
    }
}

/// Relative weights for picking calls during generation and insertion.
#[derive(Debug, Clone)]
pub struct SimChoiceTable {
    weights: Vec<u32>,
    total: u32,
}

impl SimChoiceTable {
    /// Every call equally likely.
    pub fn uniform() -> Self {
        Self::new(vec![1; SYSCALLS.len()])
    }

    /// Missing weights default to 1; a table of all zeros falls back to
    /// uniform.
    pub fn new(mut weights: Vec<u32>) -> Self {
        weights.resize(SYSCALLS.len(), 1);
        let total: u32 = weights.iter().sum();
        if total == 0 {
            return Self::uniform();
        }
        Self { weights, total }
    }

    fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let mut pick = rng.random_range(0..self.total);
        for (id, w) in self.weights.iter().enumerate() {
            if pick < *w {
                return id;
            }
            pick -= w;
        }
        self.weights.len() - 1
    }
}

impl Default for SimChoiceTable {
    fn default() -> Self {
        Self::uniform()
    }
}

/// Program model over [`SimProgram`]s, used to run the worker engine without
/// a real target.
///
/// Mutation splices from the corpus, inserts, removes and perturbs
/// arguments. Minimization drops calls back to front, then zeroes arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimModel;

impl SimModel {
    pub fn new() -> Self {
        Self
    }

    fn random_arg<R: Rng + ?Sized>(rng: &mut R) -> u64 {
        match rng.random_range(0..4) {
            0 | 1 => rng.random_range(0..0x100),
            2 => INTERESTING[rng.random_range(0..INTERESTING.len())],
            _ => rng.random(),
        }
    }

    fn random_call<R: Rng + ?Sized>(rng: &mut R, ct: &SimChoiceTable) -> SimCall {
        let id = ct.choose(rng);
        let args = (0..SYSCALLS[id].1).map(|_| Self::random_arg(rng)).collect();
        SimCall { id, args }
    }

    fn mutate_arg<R: Rng + ?Sized>(rng: &mut R, value: u64) -> u64 {
        match rng.random_range(0..3) {
            0 => value.wrapping_add(rng.random_range(1..=8)),
            1 => value.wrapping_sub(rng.random_range(1..=8)),
            _ => Self::random_arg(rng),
        }
    }
}

impl ProgramModel for SimModel {
    type Prog = SimProgram;
    type ChoiceTable = SimChoiceTable;

    fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        ncalls: usize,
        choice_table: &SimChoiceTable,
    ) -> SimProgram {
        let len = rng.random_range(1..=ncalls.max(1));
        SimProgram::new((0..len).map(|_| Self::random_call(rng, choice_table)).collect())
    }

    fn mutate<R: Rng + ?Sized>(
        &self,
        prog: &mut SimProgram,
        rng: &mut R,
        ncalls: usize,
        choice_table: &SimChoiceTable,
        corpus: &[Arc<SimProgram>],
    ) {
        let ncalls = ncalls.max(1);
        let mut mutated = false;
        while !mutated || rng.random_bool(0.5) {
            match rng.random_range(0..4) {
                0 if !corpus.is_empty() => {
                    let other = &corpus[rng.random_range(0..corpus.len())];
                    let cut = rng.random_range(0..=prog.calls.len());
                    let from = rng.random_range(0..=other.calls.len());
                    prog.calls.truncate(cut);
                    prog.calls.extend_from_slice(&other.calls[from..]);
                    prog.calls.truncate(ncalls);
                }
                1 if prog.calls.len() < ncalls => {
                    let at = rng.random_range(0..=prog.calls.len());
                    prog.calls.insert(at, Self::random_call(rng, choice_table));
                }
                2 if prog.calls.iter().any(|c| !c.args.is_empty()) => {
                    let with_args: Vec<usize> = (0..prog.calls.len())
                        .filter(|&i| !prog.calls[i].args.is_empty())
                        .collect();
                    let call = &mut prog.calls[with_args[rng.random_range(0..with_args.len())]];
                    let arg = rng.random_range(0..call.args.len());
                    call.args[arg] = Self::mutate_arg(rng, call.args[arg]);
                }
                3 if prog.calls.len() > 1 => {
                    let at = rng.random_range(0..prog.calls.len());
                    prog.calls.remove(at);
                }
                _ => continue,
            }
            mutated = true;
        }
        if prog.calls.is_empty() {
            prog.calls.push(Self::random_call(rng, choice_table));
        }
    }

    /// Greedily drops calls other than `call`, last to first, then zeroes
    /// arguments one at a time. Each step is kept only if `accept` agrees.
    fn minimize(
        &self,
        prog: &SimProgram,
        call: usize,
        accept: &mut dyn FnMut(&SimProgram, usize) -> bool,
        keep_all_calls: bool,
    ) -> (SimProgram, usize) {
        let mut best = prog.clone();
        let mut call = call;

        if !keep_all_calls {
            for idx in (0..best.calls.len()).rev() {
                if idx == call {
                    continue;
                }
                let mut candidate = best.clone();
                candidate.calls.remove(idx);
                let candidate_call = if idx < call { call - 1 } else { call };
                if accept(&candidate, candidate_call) {
                    best = candidate;
                    call = candidate_call;
                }
            }
        }

        for idx in 0..best.calls.len() {
            for arg in 0..best.calls[idx].args.len() {
                if best.calls[idx].args[arg] == 0 {
                    continue;
                }
                let mut candidate = best.clone();
                candidate.calls[idx].args[arg] = 0;
                if accept(&candidate, call) {
                    best = candidate;
                }
            }
        }
        (best, call)
    }

    fn mutate_with_hints(
        &self,
        prog: &SimProgram,
        call: usize,
        comps: &CompMap,
        exec: &mut dyn FnMut(&SimProgram),
    ) {
        let Some(target) = prog.calls.get(call) else {
            return;
        };
        for (arg, value) in target.args.iter().enumerate() {
            let Some(operands) = comps.get(value) else {
                continue;
            };
            for replacement in operands.iter().filter(|o| *o != value) {
                let mut mutant = prog.clone();
                mutant.calls[call].args[arg] = *replacement;
                exec(&mutant);
            }
        }
    }

    fn deserialize(&self, data: &[u8]) -> Result<SimProgram, anyhow::Error> {
        let text = std::str::from_utf8(data).context("program is not valid UTF-8")?;
        SimProgram::parse(text)
    }
}

fn arg_bucket(value: u64) -> u32 {
    match value {
        0 => 0,
        1..=0xff => 1,
        0x100..=0xffff => 2,
        _ => 3,
    }
}

/// Deterministic target: each call's signal depends on its id, the bucket of
/// each argument, the previous call, and whether an argument hits a magic
/// constant.
#[derive(Debug, Clone)]
pub struct SimEnv {
    faultable_points: usize,
    bug_value: Option<u64>,
    executions: u64,
}

impl SimEnv {
    pub fn new(settings: &SimSettings) -> Self {
        Self {
            faultable_points: settings.faultable_points,
            bug_value: settings.bug_value,
            executions: 0,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    fn edge(id: usize, local: u32) -> u32 {
        ((id as u32 + 1) << 16) | local
    }

    fn run_call(
        &self,
        opts: &ExecOpts,
        idx: usize,
        prev: Option<usize>,
        call: &SimCall,
    ) -> CallInfo {
        let mut signal = vec![Self::edge(call.id, 0)];
        for (i, value) in call.args.iter().enumerate() {
            signal.push(Self::edge(call.id, 0x10 + (i as u32) * 4 + arg_bucket(*value)));
            if let Some(m) = MAGIC.iter().position(|m| m == value) {
                signal.push(Self::edge(call.id, 0x100 + (i as u32) * 0x10 + m as u32));
            }
        }
        if let Some(prev) = prev {
            signal.push(Self::edge(call.id, 0x1000 + prev as u32));
        }

        let mut fault_injected = false;
        if opts.flags.inject_fault
            && opts.fault_call == idx
            && opts.fault_nth < self.faultable_points
        {
            fault_injected = true;
            signal.push(Self::edge(call.id, 0x2000 + opts.fault_nth as u32));
        }

        let cover = if opts.flags.collect_cover {
            signal.iter().map(|s| s ^ 0x8000_0000).collect()
        } else {
            Vec::new()
        };

        let mut comps = CompMap::new();
        if opts.flags.collect_comps {
            for (i, value) in call.args.iter().enumerate() {
                let magic = MAGIC[(call.id + i) % MAGIC.len()];
                comps.entry(*value).or_insert_with(BTreeSet::new).insert(magic);
            }
        }

        CallInfo {
            signal,
            cover,
            comps,
            fault_injected,
        }
    }
}

impl ExecEnv<SimProgram> for SimEnv {
    fn exec(&mut self, opts: &ExecOpts, prog: &SimProgram) -> Result<ExecOutcome, EnvError> {
        self.executions += 1;
        let mut outcome = ExecOutcome::default();
        // A tripped bug taints the whole run, so it carries no per-call info.
        if let Some(bug) = self.bug_value {
            if let Some(call) = prog.calls.iter().find(|c| c.args.contains(&bug)) {
                outcome.failed = true;
                outcome.output = format!("BUG: {} hit {:#x}\n", call.name(), bug).into_bytes();
                return Ok(outcome);
            }
        }
        let mut prev = None;
        for (idx, call) in prog.calls.iter().enumerate() {
            outcome.info.push(self.run_call(opts, idx, prev, call));
            prev = Some(call.id);
        }
        Ok(outcome)
    }
}
