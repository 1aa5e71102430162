//! Persisted run artifacts: crash records and the progress snapshot.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{stats::LoopStatus, Error};

/// Crash records land in this subdirectory of the output path.
pub const CRASH_DIR_NAME: &str = "Crashes";
/// Counter snapshot file name.
pub const PROGRESS_FILE_NAME: &str = "progress.json";

/// Everything worth keeping about one crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashRecord {
    pub iteration: u64,
    pub error_code: String,
    pub cause: String,
    pub module: String,
    pub fault_function: String,
    pub method_path: String,
    pub process_output: String,
    pub events: Vec<String>,
    pub dump_path: String,
    pub payload_hex: String,
}

/// Filesystem sink for crash records and progress; writes serialized
/// behind a lock.
#[derive(Debug)]
pub struct OutputSink {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl OutputSink {
    /// Opens (and creates) the output directory tree.
    pub fn new(base_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(base_dir.join(CRASH_DIR_NAME))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// The directory artifacts land in
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Writes one crash record, named after the iteration and method.
    pub fn save_crash(&self, record: &CrashRecord) -> Result<PathBuf, Error> {
        let method = record.method_path.trim_start_matches('/').replace('/', "_");
        let path = self
            .base_dir
            .join(CRASH_DIR_NAME)
            .join(format!("{}_{method}.json", record.iteration));

        let data = serde_json::to_vec_pretty(record)?;
        let _guard = self.write_lock.lock().unwrap();
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Overwrites the progress snapshot.
    pub fn save_progress(&self, status: &LoopStatus) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(status)?;
        let _guard = self.write_lock.lock().unwrap();
        std::fs::write(self.base_dir.join(PROGRESS_FILE_NAME), data)?;
        Ok(())
    }
}

/// Lowercase hex of a payload, for the crash record.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_file_is_named_iteration_and_method() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new(dir.path()).unwrap();
        let record = CrashRecord {
            iteration: 5,
            method_path: "/pkg.Svc/Hello".into(),
            error_code: "0xc0000005".into(),
            cause: "memory corruption / null-pointer dereference".into(),
            ..Default::default()
        };
        let path = sink.save_crash(&record).unwrap();
        assert!(path.ends_with("Crashes/5_pkg.Svc_Hello.json"));
        let read: CrashRecord =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read.error_code, "0xc0000005");
    }

    #[test]
    fn progress_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new(dir.path()).unwrap();
        let status = LoopStatus {
            iteration: 3,
            total_executions: 100,
            ..Default::default()
        };
        sink.save_progress(&status).unwrap();
        let read: LoopStatus = serde_json::from_slice(
            &std::fs::read(dir.path().join(PROGRESS_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(read.total_executions, 100);
    }

    #[test]
    fn hex_is_lowercase_two_digit() {
        assert_eq!(to_hex(&[0x0a, 0x06, 0xff]), "0a06ff");
        assert_eq!(to_hex(&[]), "");
    }
}
