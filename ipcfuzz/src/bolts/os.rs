//! OS process glue: enumerating, spawning, supervising and killing the
//! fuzz target, plus the external memory-dump tool.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use log::{debug, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::Error;

/// A process visible to the host, matched on executable basename.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// The process id
    pub pid: u32,
    /// The executable name, without path
    pub name: String,
}

#[cfg(unix)]
mod imp {
    use super::ProcessInfo;
    use crate::Error;

    /// Snapshot of the process table, read from `/proc`.
    pub fn process_list() -> Result<Vec<ProcessInfo>, Error> {
        let mut procs = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            // comm is the basename, truncated by the kernel to 15 chars.
            let comm = match std::fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) => comm,
                Err(_) => continue,
            };
            procs.push(ProcessInfo {
                pid,
                name: comm.trim_end().to_string(),
            });
        }
        Ok(procs)
    }

    pub fn kill_pid(pid: u32) -> Result<(), Error> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|err| Error::IllegalState(format!("failed to kill pid {pid}: {err}")))
    }
}

#[cfg(windows)]
mod imp {
    use super::ProcessInfo;
    use crate::Error;

    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    /// Snapshot of the process table, via Toolhelp32.
    pub fn process_list() -> Result<Vec<ProcessInfo>, Error> {
        let mut procs = Vec::new();
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
                .map_err(|err| Error::IllegalState(format!("process snapshot failed: {err}")))?;
            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..Default::default()
            };
            if Process32FirstW(snapshot, &mut entry).is_ok() {
                loop {
                    let len = entry
                        .szExeFile
                        .iter()
                        .position(|&c| c == 0)
                        .unwrap_or(entry.szExeFile.len());
                    procs.push(ProcessInfo {
                        pid: entry.th32ProcessID,
                        name: String::from_utf16_lossy(&entry.szExeFile[..len]),
                    });
                    if Process32NextW(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
        }
        Ok(procs)
    }

    pub fn kill_pid(pid: u32) -> Result<(), Error> {
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, false, pid)
                .map_err(|err| Error::IllegalState(format!("failed to open pid {pid}: {err}")))?;
            let ret = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
            ret.map_err(|err| Error::IllegalState(format!("failed to kill pid {pid}: {err}")))
        }
    }
}

/// Snapshot of the process table.
pub fn process_list() -> Result<Vec<ProcessInfo>, Error> {
    imp::process_list()
}

/// Finds a process by executable basename.
pub fn find_process(exec_name: &str) -> Option<ProcessInfo> {
    let procs = process_list().ok()?;
    procs.into_iter().find(|p| p.name == exec_name)
}

/// Is a process with this executable basename alive right now?
#[must_use]
pub fn is_process_running(exec_name: &str) -> bool {
    find_process(exec_name).is_some()
}

/// Kills the first process matching the executable basename.
pub fn kill_process(exec_name: &str) -> Result<(), Error> {
    match find_process(exec_name) {
        Some(proc) => imp::kill_pid(proc.pid),
        None => Err(Error::IllegalState(format!(
            "no process named {exec_name} to kill"
        ))),
    }
}

/// What the supervisor reports about the target while it runs.
#[derive(Debug, Clone)]
pub enum ProcessUpdate {
    /// A snapshot of everything the target wrote to stderr so far
    Stderr(String),
    /// The target exited on its own, with the given code if any
    Exit(Option<i32>),
    /// Reading from the target failed
    Failed(String),
}

/// Spawns and watches the fuzz target.
///
/// The target runs with its working directory set to the executable's own
/// directory, stderr piped. A background task forwards [`ProcessUpdate`]s
/// over a bounded channel until the target exits.
#[derive(Debug)]
pub struct ProcessSupervisor {
    exec_path: PathBuf,
    args: Vec<String>,
}

impl ProcessSupervisor {
    /// Supervisor for the given executable and arguments
    #[must_use]
    pub fn new(exec_path: PathBuf, args: Vec<String>) -> Self {
        Self { exec_path, args }
    }

    /// The executable basename used for liveness checks and kills
    #[must_use]
    pub fn exec_name(&self) -> String {
        Path::new(&self.exec_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.exec_path.to_string_lossy().into_owned())
    }

    /// Is the target alive right now?
    #[must_use]
    pub fn is_running(&self) -> bool {
        is_process_running(&self.exec_name())
    }

    /// Kills the target, if it is alive.
    pub fn kill(&self) -> Result<(), Error> {
        kill_process(&self.exec_name())
    }

    /// Starts the target and begins forwarding stderr snapshots.
    pub fn start(&mut self) -> Result<mpsc::Receiver<ProcessUpdate>, Error> {
        let workdir = self
            .exec_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut child = Command::new(&self.exec_path)
            .args(&self.args)
            .current_dir(workdir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().ok_or_else(|| {
            Error::IllegalState("spawned target has no stderr handle".to_string())
        })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        collected.push_str(&line);
                        collected.push('\n');
                        if tx.send(ProcessUpdate::Stderr(collected.clone())).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(ProcessUpdate::Failed(format!("{err}"))).await;
                        break;
                    }
                }
            }
            match child.wait().await {
                Ok(status) => {
                    debug!("target exited with {status}");
                    let _ = tx.send(ProcessUpdate::Exit(status.code())).await;
                }
                Err(err) => {
                    let _ = tx.send(ProcessUpdate::Failed(format!("{err}"))).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Drives an external Sysinternals-style dump tool against the target.
#[derive(Debug, Clone)]
pub struct MemoryDump {
    binary_path: PathBuf,
    dump_output_dir: PathBuf,
    dump_tool_path: PathBuf,
}

impl MemoryDump {
    /// A dump runner for the given target binary, output directory and tool
    #[must_use]
    pub fn new(binary_path: PathBuf, dump_output_dir: PathBuf, dump_tool_path: PathBuf) -> Self {
        Self {
            binary_path,
            dump_output_dir,
            dump_tool_path,
        }
    }

    /// Kicks off a full memory dump of the target process.
    ///
    /// Returns the path the dump will land at. The tool runs detached; the
    /// dump may still be in flight when this returns.
    pub fn start_dump(&self) -> Result<PathBuf, Error> {
        if !self.dump_tool_path.is_file() {
            return Err(Error::IllegalArgument(format!(
                "memory dump tool does not exist at {}",
                self.dump_tool_path.display()
            )));
        }
        if !self.dump_output_dir.is_dir() {
            return Err(Error::IllegalArgument(format!(
                "output directory for memory dumps does not exist: {}",
                self.dump_output_dir.display()
            )));
        }

        let exec_name = Path::new(&self.binary_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let dump_path = self.dump_output_dir.join(format!("{exec_name}_{stamp}"));

        let tool_workdir = self
            .dump_tool_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cmd = std::process::Command::new(&self.dump_tool_path);
        cmd.args([
            "-accepteula",
            "-e",
            "-t",
            "-w",
            &exec_name,
            &dump_path.to_string_lossy(),
        ])
        .current_dir(tool_workdir);

        match cmd.spawn() {
            Ok(_) => Ok(dump_path),
            Err(err) => {
                warn!("failed to spawn dump tool: {err}");
                Err(Error::File(err))
            }
        }
    }
}
