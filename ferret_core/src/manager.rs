use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure of a call to the manager or of the local report store.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Manager I/O error: {0}")]
    Io(String),
    #[error("Manager serialization error: {0}")]
    Serialization(String),
    #[error("Manager deserialization error: {0}")]
    Deserialization(String),
    /// The remote end refused the call.
    #[error("Manager rejected the call: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        ManagerError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Deserialization(format!("JSON operation error: {}", err))
    }
}
impl From<EncodeError> for ManagerError {
    fn from(err: EncodeError) -> Self {
        ManagerError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for ManagerError {
    fn from(err: DecodeError) -> Self {
        ManagerError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// A reproducing input as it travels to the manager.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct RpcInput {
    /// Name of the call whose coverage made the input interesting.
    pub call: String,
    /// Serialized program.
    pub prog: Vec<u8>,
    /// Canonical signal of the call, sorted.
    pub signal: Vec<u32>,
    pub cover: Vec<u32>,
}

/// Arguments of the "new input" call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewInputArgs {
    /// Identity of the reporting worker.
    pub name: String,
    #[serde(flatten)]
    pub input: RpcInput,
}

/// The manager side of the worker: where confirmed new inputs are reported.
///
/// The manager owns the global corpus and normally sits behind an RPC
/// boundary. A failed call is fatal for the reporting worker.
pub trait Manager: Send + Sync {
    /// Reports a triaged, minimized input. Any error is fatal to the caller.
    fn new_input(&self, args: NewInputArgs) -> Result<(), ManagerError>;
}

/// Keeps every reported input in memory.
#[derive(Debug, Default)]
pub struct InMemoryManager {
    inputs: Mutex<Vec<NewInputArgs>>,
}

impl InMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> Vec<NewInputArgs> {
        self.inputs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Manager for InMemoryManager {
    fn new_input(&self, args: NewInputArgs) -> Result<(), ManagerError> {
        self.inputs.lock().push(args);
        Ok(())
    }
}

/// Index record describing one stored report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportIndexEntry {
    /// Content hash of the program, also the file stem.
    pub hash: String,
    pub reporter: String,
    pub call: String,
    pub signal_len: usize,
    pub cover_len: usize,
}

/// Stores each reported input as a bincode file named after the program's
/// content hash, plus a JSON index of all reports.
///
/// Reporting the same program twice overwrites its file but adds no index
/// entry.
pub struct DiskManager {
    dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<Vec<ReportIndexEntry>>,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl DiskManager {
    const INDEX_FILENAME: &'static str = "reports_index.json";
    const INPUT_FILE_EXTENSION: &'static str = "input";

    fn current_bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Opens the store at `dir`, creating the directory if needed and picking
    /// up an existing index.
    pub fn new(dir: PathBuf) -> Result<Self, ManagerError> {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                ManagerError::Io(format!(
                    "Failed to create report directory at {:?}: {}",
                    dir, e
                ))
            })?;
        } else if !dir.is_dir() {
            return Err(ManagerError::Io(format!(
                "Report path {:?} exists but is not a directory",
                dir
            )));
        }

        let index_path = dir.join(Self::INDEX_FILENAME);
        let index = Self::load_index(&index_path)?;
        let manager = Self {
            dir,
            index_path,
            index: Mutex::new(index),
            bincode_config: Self::current_bincode_config(),
        };
        if !manager.index_path.exists() {
            manager.save_index(&manager.index.lock())?;
        }
        Ok(manager)
    }

    fn load_index(index_path: &Path) -> Result<Vec<ReportIndexEntry>, ManagerError> {
        if !index_path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(index_path).map_err(|e| {
            ManagerError::Io(format!("Failed to open index file {:?}: {}", index_path, e))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            ManagerError::Deserialization(format!(
                "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                index_path, e
            ))
        })
    }

    fn save_index(&self, index: &[ReportIndexEntry]) -> Result<(), ManagerError> {
        let file = File::create(&self.index_path).map_err(|e| {
            ManagerError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_path, e
            ))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, index).map_err(|e| {
            ManagerError::Serialization(format!(
                "Failed to serialize report index to JSON for {:?}: {}",
                self.index_path, e
            ))
        })?;
        writer.flush()?;
        Ok(())
    }

    fn input_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash).with_extension(Self::INPUT_FILE_EXTENSION)
    }

    pub fn entries(&self) -> Vec<ReportIndexEntry> {
        self.index.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads back a stored report by program hash.
    pub fn load_input(&self, hash: &str) -> Result<RpcInput, ManagerError> {
        let path = self.input_path(hash);
        let content = fs::read(&path).map_err(|e| {
            ManagerError::Io(format!("Failed to read input file {:?}: {}", path, e))
        })?;
        let (input, _len): (RpcInput, usize) =
            bincode::decode_from_slice(&content, self.bincode_config)?;
        Ok(input)
    }
}

impl Manager for DiskManager {
    fn new_input(&self, args: NewInputArgs) -> Result<(), ManagerError> {
        let hash = crate::corpus::content_hash(&args.input.prog);
        let bytes = bincode::encode_to_vec(&args.input, self.bincode_config)?;
        let path = self.input_path(&hash);
        fs::write(&path, &bytes).map_err(|e| {
            ManagerError::Io(format!("Failed to write input file {:?}: {}", path, e))
        })?;

        let mut index = self.index.lock();
        if index.iter().any(|e| e.hash == hash) {
            return Ok(());
        }
        index.push(ReportIndexEntry {
            hash,
            reporter: args.name,
            call: args.input.call,
            signal_len: args.input.signal.len(),
            cover_len: args.input.cover.len(),
        });
        self.save_index(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(prog: &[u8]) -> NewInputArgs {
        NewInputArgs {
            name: "vm0".into(),
            input: RpcInput {
                call: "open".into(),
                prog: prog.to_vec(),
                signal: vec![1, 5, 9],
                cover: vec![0x100, 0x104],
            },
        }
    }

    #[test]
    fn in_memory_manager_records_reports() {
        let manager = InMemoryManager::new();
        assert!(manager.is_empty());
        manager.new_input(args(b"open(0x1)\n")).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.inputs()[0].input.call, "open");
    }

    #[test]
    fn new_input_args_serialize_flat() {
        let json = serde_json::to_value(args(b"x")).unwrap();
        assert_eq!(json["name"], "vm0");
        assert_eq!(json["call"], "open");
        assert_eq!(json["signal"], serde_json::json!([1, 5, 9]));
    }

    #[test]
    fn disk_manager_persists_inputs_and_index() -> Result<(), ManagerError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("reports");
        let manager = DiskManager::new(path.clone())?;
        assert!(path.join(DiskManager::INDEX_FILENAME).exists());

        manager.new_input(args(b"open(0x1)\n"))?;
        manager.new_input(args(b"close(0x1)\n"))?;
        manager.new_input(args(b"open(0x1)\n"))?;
        assert_eq!(manager.len(), 2);

        let hash = crate::corpus::content_hash(b"open(0x1)\n");
        let stored = manager.load_input(&hash)?;
        assert_eq!(stored, args(b"open(0x1)\n").input);

        let reopened = DiskManager::new(path)?;
        assert_eq!(reopened.entries(), manager.entries());
        assert_eq!(reopened.entries()[0].signal_len, 3);
        Ok(())
    }

    #[test]
    fn disk_manager_rejects_file_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = DiskManager::new(file.path().to_path_buf());
        assert!(matches!(result, Err(ManagerError::Io(_))));
    }

    #[test]
    fn disk_manager_reports_corrupt_index() -> Result<(), ManagerError> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(DiskManager::INDEX_FILENAME), b"{not json")?;
        let result = DiskManager::new(dir.path().to_path_buf());
        assert!(matches!(result, Err(ManagerError::Deserialization(_))));
        Ok(())
    }
}
