//! Child-process bookkeeping for the pipeline.
//!
//! Every external tool spawned on behalf of an entry is registered in the
//! [`ChildTable`] keyed by entry id before the worker waits on it, and
//! removed immediately after it exits. The cancel path looks the handle up
//! by id and sends a kill signal; the waiting side polls `try_wait` so the
//! two never contend for the handle for long.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{JournalError, Result};

/// How often the waiting worker polls the child for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// Table of live child processes, keyed by entry id.
///
/// At most one child runs per entry at a time (the pipeline is sequential
/// within an entry), so a plain map suffices.
#[derive(Debug, Default)]
pub struct ChildTable {
    inner: Mutex<HashMap<String, Arc<Mutex<Child>>>>,
}

impl ChildTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, entry_id: &str, child: Child) -> Arc<Mutex<Child>> {
        let handle = Arc::new(Mutex::new(child));
        self.inner
            .lock()
            .await
            .insert(entry_id.to_owned(), Arc::clone(&handle));
        handle
    }

    async fn deregister(&self, entry_id: &str) {
        self.inner.lock().await.remove(entry_id);
    }

    /// Best-effort kill of the live child for an entry. Returns whether a
    /// handle was found.
    pub async fn kill(&self, entry_id: &str) -> bool {
        let handle = {
            let table = self.inner.lock().await;
            table.get(entry_id).cloned()
        };
        match handle {
            Some(child) => {
                let mut child = child.lock().await;
                if let Err(e) = child.start_kill() {
                    // Already exited is the common benign case here.
                    debug!(entry_id, error = %e, "kill signal not delivered");
                } else {
                    warn!(entry_id, "killed child process on cancel");
                }
                true
            }
            None => false,
        }
    }

    /// Number of tracked children (diagnostics).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Captured result of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// The tail of the diagnostic stream, for error messages.
    pub fn stderr_tail(&self) -> &str {
        let start = self.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        // Stay on a char boundary.
        let mut start = start;
        while start < self.stderr.len() && !self.stderr.is_char_boundary(start) {
            start += 1;
        }
        self.stderr[start..].trim()
    }
}

/// Spawn `cmd` registered under `entry_id`, wait for it to exit, and return
/// its captured output.
///
/// The child is visible in the table for the whole wait so a cancel can kill
/// it mid-run; a killed child surfaces as `success == false`.
pub async fn run_tool(
    table: &ChildTable,
    entry_id: &str,
    cmd: &mut Command,
    tool_name: &str,
) -> Result<ToolOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            JournalError::Config(format!("{tool_name} not found on PATH"))
        }
        _ => JournalError::Io(e),
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let handle = table.register(entry_id, child).await;

    let status = loop {
        {
            let mut child = handle.lock().await;
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    table.deregister(entry_id).await;
                    return Err(e.into());
                }
            }
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    };

    table.deregister(entry_id).await;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ToolOutput {
        success: status.success(),
        code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}
