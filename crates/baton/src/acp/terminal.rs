//! Registry of agent-driven grandchild shells.
//!
//! The agent may ask the gateway to run commands in terminals it controls
//! (`terminal/create` … `terminal/kill`). Each terminal is a grandchild
//! process whose stdout and stderr are accumulated into a per-terminal
//! buffer; `terminal/output` drains and clears that buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use uuid::Uuid;

/// Exit report for one finished terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    /// Process exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal name, when the process was killed by a signal.
    pub signal: Option<String>,
}

/// Drained output plus the exit report when the process has finished.
#[derive(Clone, Debug)]
pub struct TerminalOutputSnapshot {
    pub output: String,
    pub exit: Option<ExitInfo>,
}

struct TerminalEntry {
    pid: Option<u32>,
    buffer: Arc<Mutex<String>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

/// All live terminals owned by one agent connection.
#[derive(Default)]
pub struct TerminalRegistry {
    entries: Mutex<HashMap<String, TerminalEntry>>,
}

impl TerminalRegistry {
    /// Spawns a grandchild process and starts accumulating its output.
    ///
    /// # Errors
    /// Returns an error when the process cannot be spawned.
    pub fn create(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        default_cwd: &Path,
    ) -> Result<String, String> {
        let working_dir: PathBuf = match cwd {
            Some(cwd) if cwd.is_absolute() => cwd.to_path_buf(),
            Some(cwd) => default_cwd.join(cwd),
            None => default_cwd.to_path_buf(),
        };

        let mut process = tokio::process::Command::new(command);
        process
            .args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (key, value) in env {
            process.env(key, value);
        }

        let mut child = process
            .spawn()
            .map_err(|error| format!("failed to spawn terminal `{command}`: {error}"))?;
        let pid = child.id();
        let buffer = Arc::new(Mutex::new(String::new()));
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Some(stdout) = child.stdout.take() {
            Self::pump_stream(stdout, Arc::clone(&buffer));
        }
        if let Some(stderr) = child.stderr.take() {
            Self::pump_stream(stderr, Arc::clone(&buffer));
        }
        tokio::spawn(async move {
            let status = child.wait().await;
            let info = match status {
                Ok(status) => exit_info_from_status(&status),
                Err(_) => ExitInfo {
                    exit_code: None,
                    signal: None,
                },
            };
            let _ = exit_tx.send(Some(info));
        });

        let terminal_id = format!("term-{}", Uuid::new_v4());
        self.lock_entries().insert(
            terminal_id.clone(),
            TerminalEntry {
                pid,
                buffer,
                exit_rx,
            },
        );

        Ok(terminal_id)
    }

    /// Drains the accumulated output and reports the exit when finished.
    ///
    /// # Errors
    /// Returns an error for unknown terminal ids.
    pub fn output(&self, terminal_id: &str) -> Result<TerminalOutputSnapshot, String> {
        let entries = self.lock_entries();
        let entry = entries
            .get(terminal_id)
            .ok_or_else(|| format!("unknown terminal: {terminal_id}"))?;
        let output = {
            let mut buffer = entry
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *buffer)
        };
        let exit = entry.exit_rx.borrow().clone();

        Ok(TerminalOutputSnapshot { output, exit })
    }

    /// Waits until the grandchild exits and returns its exit report.
    ///
    /// # Errors
    /// Returns an error for unknown terminal ids or a lost exit channel.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<ExitInfo, String> {
        let mut exit_rx = {
            let entries = self.lock_entries();
            let entry = entries
                .get(terminal_id)
                .ok_or_else(|| format!("unknown terminal: {terminal_id}"))?;
            entry.exit_rx.clone()
        };

        loop {
            let current = exit_rx.borrow().clone();
            if let Some(info) = current {
                return Ok(info);
            }
            exit_rx
                .changed()
                .await
                .map_err(|_| "terminal exit channel closed".to_string())?;
        }
    }

    /// SIGTERMs the grandchild when alive and removes the entry.
    ///
    /// # Errors
    /// Returns an error for unknown terminal ids.
    pub fn kill(&self, terminal_id: &str) -> Result<(), String> {
        let entry = self
            .lock_entries()
            .remove(terminal_id)
            .ok_or_else(|| format!("unknown terminal: {terminal_id}"))?;
        Self::terminate(&entry);

        Ok(())
    }

    /// Releases the terminal: same teardown as [`TerminalRegistry::kill`].
    ///
    /// # Errors
    /// Returns an error for unknown terminal ids.
    pub fn release(&self, terminal_id: &str) -> Result<(), String> {
        self.kill(terminal_id)
    }

    /// SIGTERMs every live terminal; used when the agent connection stops.
    pub fn kill_all(&self) {
        let entries: Vec<TerminalEntry> = self.lock_entries().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            Self::terminate(entry);
        }
    }

    fn terminate(entry: &TerminalEntry) {
        let exited = entry.exit_rx.borrow().is_some();
        if exited {
            return;
        }
        if let Some(pid) = entry.pid
            && let Ok(pid) = i32::try_from(pid)
        {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    fn pump_stream<R>(mut stream: R, buffer: Arc<Mutex<String>>)
    where
        R: AsyncReadExt + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut chunk = [0_u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        let text = String::from_utf8_lossy(&chunk[..read]).to_string();
                        buffer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push_str(&text);
                    }
                }
            }
        });
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, TerminalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn exit_info_from_status(status: &std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status
            .signal()
            .and_then(|raw| Signal::try_from(raw).ok())
            .map(|signal| format!("{signal:?}"))
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        exit_code: status.code(),
        signal,
    }
}
