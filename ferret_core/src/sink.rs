use crate::env::ExecOpts;
use crate::program::Program;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

const KMSG_PATH: &str = "/dev/kmsg";

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Where executed programs are mirrored before they run.
pub enum OutputMode {
    #[default]
    None,
    Stdout,
    Dmesg,
    File,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(OutputMode::None),
            "stdout" => Ok(OutputMode::Stdout),
            "dmesg" => Ok(OutputMode::Dmesg),
            "file" => Ok(OutputMode::File),
            other => Err(format!(
                "unknown output mode '{other}' (expected none, stdout, dmesg or file)"
            )),
        }
    }
}

/// Mirrors every executed program somewhere a human can find it after the
/// target dies. The program that crashed the target is the last one written.
///
/// Console writes go through one mutex so that programs from concurrent
/// workers never interleave. Failures to write dmesg or files are ignored.
pub struct DiagnosticSink {
    mode: OutputMode,
    name: String,
    dir: PathBuf,
    /// Serializes console writes so programs from different workers never
    /// interleave.
    console: Mutex<Box<dyn Write + Send>>,
}

impl DiagnosticSink {
    pub fn new(mode: OutputMode, name: impl Into<String>) -> Self {
        Self {
            mode,
            name: name.into(),
            dir: PathBuf::from("."),
            console: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(OutputMode::None, "")
    }

    /// Directory for per-worker program files in [`OutputMode::File`].
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Replaces stdout as the console destination.
    pub fn with_console(mut self, writer: impl Write + Send + 'static) -> Self {
        self.console = Mutex::new(Box::new(writer));
        self
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn file_path(&self, pid: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.prog", self.name, pid))
    }

    pub fn mirror<P: Program>(&self, pid: usize, opts: &ExecOpts, prog: &P) {
        match self.mode {
            OutputMode::None => {}
            OutputMode::Stdout => {
                let data = prog.serialize();
                let mut console = self.console.lock();
                let _ = writeln!(console, "executing program {pid}{opts}:");
                let _ = console.write_all(&data);
                let _ = console.flush();
            }
            OutputMode::Dmesg => {
                if let Ok(mut kmsg) = OpenOptions::new().write(true).open(KMSG_PATH) {
                    let mut buf = format!("ferret: executing program {pid}{opts}:\n").into_bytes();
                    buf.extend_from_slice(&prog.serialize());
                    let _ = kmsg.write_all(&buf);
                }
            }
            OutputMode::File => {
                if let Ok(mut f) = File::create(self.file_path(pid)) {
                    if opts.flags.inject_fault {
                        let _ = writeln!(f, "#{opts}");
                    }
                    let _ = f.write_all(&prog.serialize());
                }
            }
        }
    }
}
