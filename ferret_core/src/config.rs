use crate::sink::OutputMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Identity reported to the manager along with every new input.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_procs")]
    pub procs: usize,
    /// Stop each worker after this many iterations. Unset means run forever.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_program_length")]
    pub program_length: usize,
    #[serde(default)]
    pub output: OutputMode,
    /// Directory for `output = "file"` program dumps.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub cover: bool,
    #[serde(default)]
    pub fault_injection: bool,
    #[serde(default)]
    pub comparisons: bool,
    #[serde(default)]
    pub leak_check: bool,
    /// Concurrent executions admitted by the gate. 0 means twice `procs`.
    #[serde(default)]
    pub gate_capacity: usize,
    #[serde(default = "default_leak_interval")]
    pub leak_interval: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_name() -> String {
    "ferret".to_string()
}
pub fn default_procs() -> usize {
    1
}
pub fn default_program_length() -> usize {
    30
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_true() -> bool {
    true
}
fn default_leak_interval() -> u64 {
    128
}
fn default_stats_interval_secs() -> u64 {
    10
}

impl FuzzerSettings {
    pub fn effective_gate_capacity(&self) -> usize {
        if self.gate_capacity == 0 {
            self.procs.max(1) * 2
        } else {
            self.gate_capacity
        }
    }
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            procs: default_procs(),
            max_iterations: None,
            program_length: default_program_length(),
            output: OutputMode::default(),
            output_dir: default_output_dir(),
            cover: true,
            fault_injection: false,
            comparisons: false,
            leak_check: false,
            gate_capacity: 0,
            leak_interval: default_leak_interval(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

/// Budgets of the triage and smash stages.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageSettings {
    /// Executions spent deflaking or harvesting cover for one item.
    #[serde(default = "default_triage_attempts")]
    pub attempts: usize,
    /// Runs in which the triaged call may fail to execute before the item is
    /// dropped as too flaky.
    #[serde(default = "default_not_executed_tolerance")]
    pub not_executed_tolerance: usize,
    #[serde(default = "default_smash_budget")]
    pub smash_budget: usize,
    #[serde(default = "default_fault_nth_cap")]
    pub fault_nth_cap: usize,
    /// Every this many idle iterations the worker generates instead of
    /// mutating.
    #[serde(default = "default_generate_period")]
    pub generate_period: u64,
}

fn default_triage_attempts() -> usize {
    3
}
fn default_not_executed_tolerance() -> usize {
    1
}
fn default_smash_budget() -> usize {
    100
}
fn default_fault_nth_cap() -> usize {
    100
}
fn default_generate_period() -> u64 {
    100
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            attempts: default_triage_attempts(),
            not_executed_tolerance: default_not_executed_tolerance(),
            smash_budget: default_smash_budget(),
            fault_nth_cap: default_fault_nth_cap(),
            generate_period: default_generate_period(),
        }
    }
}

/// Knobs of the simulated environment shipped with the crate.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SimSettings {
    #[serde(default = "default_faultable_points")]
    pub faultable_points: usize,
    /// Argument value that makes the simulated target report a bug.
    #[serde(default)]
    pub bug_value: Option<u64>,
}

fn default_faultable_points() -> usize {
    5
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            faultable_points: default_faultable_points(),
            bug_value: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Retries of a transiently failing execution before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub collide: bool,
    #[serde(default)]
    pub sim: SimSettings,
}

pub fn default_max_retries() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            collide: false,
            sim: SimSettings::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Files or directories of serialized programs to run as candidates.
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
    /// Where reported inputs are stored. Unset keeps them in memory.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FerretConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub triage: TriageSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
}

impl FerretConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
