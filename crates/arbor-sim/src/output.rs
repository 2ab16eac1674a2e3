use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Set once in main(), appended to by every emit().
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// `<dir>/arbor-sim_<mode>_<YYYYMMDD-HHMMSS>.jsonl`, suffixed `_2`, `_3`...
/// when a run in the same second already wrote one.
pub fn resolve_jsonl_path(dir: &Path, mode: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let base = format!("arbor-sim_{mode}_{timestamp}");

    let mut candidate = dir.join(format!("{base}.jsonl"));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{base}_{n}.jsonl"));
        n += 1;
    }
    Ok(candidate)
}

pub fn init_jsonl_writer(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "JSONL writer already set"))
}

/// No-op unless a writer was installed.
pub fn write_jsonl_line(line: &str) {
    if let Some(writer) = JSONL_WRITER.get() {
        let mut w = writer.lock();
        let _ = writeln!(w, "{line}");
        let _ = w.flush();
    }
}
