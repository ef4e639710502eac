use crate::program::Program;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors from loading seed inputs off disk.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading a seed file or directory.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Immutable point-in-time view of the corpus.
///
/// Appends made after the snapshot was taken are not visible through it, so a
/// worker can pick and splice from it without seeing the collection change.
pub type CorpusSnapshot<P> = Arc<Vec<Arc<P>>>;

#[derive(Debug)]
struct CorpusInner<P> {
    progs: CorpusSnapshot<P>,
    hashes: HashSet<String>,
}

/// The worker-local, append-only corpus of interesting programs.
#[derive(Debug)]
pub struct Corpus<P> {
    inner: RwLock<CorpusInner<P>>,
}

impl<P: Program> Default for Corpus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Program> Corpus<P> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CorpusInner {
                progs: Arc::new(Vec::new()),
                hashes: HashSet::new(),
            }),
        }
    }

    /// Appends `prog` unless a program with the same content hash is already
    /// present. Returns whether it was added.
    pub fn add(&self, prog: P, hash: String) -> bool {
        let mut inner = self.inner.write();
        if !inner.hashes.insert(hash) {
            return false;
        }
        // Copy-on-write: outstanding snapshots keep the old vector.
        Arc::make_mut(&mut inner.progs).push(Arc::new(prog));
        true
    }

    pub fn snapshot(&self) -> CorpusSnapshot<P> {
        Arc::clone(&self.inner.read().progs)
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.inner.read().hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().progs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hex md5 of serialized program bytes.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn read_seed(path: &Path) -> Result<Vec<u8>, CorpusError> {
    fs::read(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))
}

/// Reads seed files. Each path is either a file or a directory whose direct,
/// non-hidden children are read; subdirectories are not traversed.
pub fn load_seed_files(seed_paths: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<u8>)>, CorpusError> {
    let mut seeds = Vec::new();
    for path in seed_paths {
        if path.is_file() {
            seeds.push((path.clone(), read_seed(path)?));
        } else if path.is_dir() {
            let entries = fs::read_dir(path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
            })?;
            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| {
                    CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                })?;
                let file_path = entry.path();
                if file_path.is_file() && !is_hidden(&file_path) {
                    files.push(file_path);
                }
            }
            files.sort();
            for file_path in files {
                let data = read_seed(&file_path)?;
                seeds.push((file_path, data));
            }
        } else {
            return Err(CorpusError::Io(format!(
                "Seed path {:?} is neither a file nor a directory",
                path
            )));
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Clone, Debug, PartialEq)]
    struct Bytes(Vec<u8>);

    impl Program for Bytes {
        fn serialize(&self) -> Vec<u8> {
            self.0.clone()
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn call_name(&self, _idx: usize) -> Option<&str> {
            None
        }
    }

    #[test]
    fn add_dedups_by_hash() {
        let corpus = Corpus::new();
        let a = Bytes(vec![1, 2, 3]);
        assert!(corpus.add(a.clone(), content_hash(&a.serialize())));
        assert!(!corpus.add(a.clone(), content_hash(&a.serialize())));
        assert_eq!(corpus.len(), 1);
        assert!(corpus.contains_hash(&content_hash(&[1, 2, 3])));
    }

    #[test]
    fn snapshot_is_not_affected_by_later_appends() {
        let corpus = Corpus::new();
        corpus.add(Bytes(vec![1]), "a".into());
        let snap = corpus.snapshot();
        corpus.add(Bytes(vec![2]), "b".into());
        corpus.add(Bytes(vec![3]), "c".into());
        assert_eq!(snap.len(), 1);
        assert_eq!(*snap[0], Bytes(vec![1]));
        let fresh = corpus.snapshot();
        assert_eq!(fresh.len(), 3);
        assert_eq!(*fresh[2], Bytes(vec![3]));
    }

    #[test]
    fn content_hash_is_hex_md5() {
        assert_eq!(content_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn load_seed_files_reads_files_and_directories() -> Result<(), CorpusError> {
        let dir = tempfile::tempdir()?;
        let seeds_dir = dir.path().join("seeds");
        fs::create_dir(&seeds_dir)?;
        fs::File::create(seeds_dir.join("b.prog"))?.write_all(b"close(0x1)\n")?;
        fs::File::create(seeds_dir.join("a.prog"))?.write_all(b"open(0x0)\n")?;
        fs::File::create(seeds_dir.join(".hidden"))?.write_all(b"junk")?;
        fs::create_dir(seeds_dir.join("nested"))?;
        let single = dir.path().join("single.prog");
        fs::write(&single, b"read(0x2)\n")?;

        let seeds = load_seed_files(&[seeds_dir.clone(), single.clone()])?;
        let names: Vec<_> = seeds
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.prog", "b.prog", "single.prog"]);
        assert_eq!(seeds[0].1, b"open(0x0)\n");
        Ok(())
    }

    #[test]
    fn load_seed_files_rejects_missing_path() {
        let err = load_seed_files(&[PathBuf::from("/nonexistent/ferret/seeds")]).unwrap_err();
        assert!(matches!(err, CorpusError::Io(_)));
    }

    #[test]
    fn seed_read_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.prog");
        let CorpusError::Io(msg) = read_seed(&missing).unwrap_err();
        assert!(msg.contains("gone.prog"), "{msg}");
    }
}
