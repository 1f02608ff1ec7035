//! Typed CSV log files, one per event kind.
//!
//! Files live under `<root>/<pid>/`, where the root comes from
//! `$LD_PRELOAD_LOG` (default `./logs/`). Each file is created on the first
//! event of its kind and opened close-on-exec, so an `exec`ing child starts
//! its own set. Only the drain worker writes rows, which keeps the files
//! free of interleaving without any per-file locking.

use std::fs::{DirBuilder, File};
use std::io::{BufWriter, Write as _};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::ffi::{self, Fatal};
use crate::lock;
use crate::record::{Event, Kind, Row, KIND_COUNT};


const ROOT_ENV: &str = "LD_PRELOAD_LOG";
const DEFAULT_ROOT: &str = "./logs/";

pub struct Sink {
    dir: Option<PathBuf>,
    files: [Option<BufWriter<File>>; KIND_COUNT],
}

static SINK: Lazy<Mutex<Sink>> = Lazy::new(|| {
    Mutex::new(Sink {
        dir: None,
        files: std::array::from_fn(|_| None),
    })
});

pub(crate) fn global() -> MutexGuard<'static, Sink> {
    lock(&SINK)
}

/// Flushes and closes every open log file, and forgets the directory so a
/// later restart re-reads the environment. Runs once the drain worker has
/// been joined, when no further rows can arrive.
pub fn close() {
    let mut sink = lock(&SINK);
    for slot in &mut sink.files {
        if let Some(mut file) = slot.take() {
            let _ = file.flush();
        }
    }
    sink.dir = None;
}

impl Sink {
    /// The per-pid log directory, created (mode 0777, umask applies) on
    /// first use.
    fn dir(&mut self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        let root = std::env::var(ROOT_ENV)
            .ok()
            .filter(|root| !root.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOT.into());
        let dir = PathBuf::from(root).join(ffi::getpid().to_string());
        let _ = DirBuilder::new().recursive(true).mode(0o777).create(&dir);
        self.dir = Some(dir.clone());
        dir
    }

    fn writer(&mut self, kind: Kind) -> &mut BufWriter<File> {
        let dir = self.dir();
        self.files[kind as usize].get_or_insert_with(|| {
            let path = dir.join(format!("{}.csv", kind.file_stem()));
            let file = File::create(&path)
                .unwrap_or_else(|source| ffi::fatal(Fatal::LogCreate { path, source }));
            let mut file = BufWriter::new(file);
            let _ = writeln!(file, "thread,time_ns,{}", kind.schema());
            file
        })
    }

    /// Appends one row: `thread,time_ns` relative to the origin, then the
    /// kind-specific columns.
    pub fn write_event(&mut self, event: &Event, origin: u64) {
        let mut columns = Row::new();
        event.payload.columns(&mut columns);
        let time_ns = event.time_ns.wrapping_sub(origin);
        let file = self.writer(event.payload.kind());
        let _ = writeln!(file, "{},{},{}", event.tid, time_ns, columns);
    }
}
