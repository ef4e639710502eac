pub mod config;
pub mod corpus;
pub mod driver;
pub mod env;
pub mod error;
pub mod fuzzer;
pub mod gate;
pub mod manager;
pub mod program;
pub mod signal;
pub mod sim;
pub mod sink;
pub mod smash;
pub mod stats;
pub mod triage;
pub mod work;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::FerretConfig;
pub use corpus::{Corpus, CorpusError, CorpusSnapshot, content_hash, load_seed_files};
pub use driver::ExecDriver;
pub use env::{CallInfo, CompMap, EnvError, ExecEnv, ExecFlags, ExecOpts, ExecOutcome};
pub use error::FatalError;
pub use fuzzer::Fuzzer;
pub use gate::{Gate, Ticket};
pub use manager::{DiskManager, InMemoryManager, Manager, ManagerError, NewInputArgs, RpcInput};
pub use program::{Program, ProgramModel};
pub use signal::{Cover, Signal, SignalStore};
pub use sim::{SimChoiceTable, SimEnv, SimModel, SimProgram};
pub use sink::{DiagnosticSink, OutputMode};
pub use stats::{Stat, Stats, StatsSnapshot};
pub use triage::TriageOutcome;
pub use work::{ProgFlags, WorkCandidate, WorkItem, WorkKind, WorkQueue, WorkSmash, WorkTriage};
pub use worker::{ExecRequest, Step, Worker};
