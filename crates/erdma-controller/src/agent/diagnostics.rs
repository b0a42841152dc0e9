//! Thread dump on SIGUSR1.

use std::fmt::Write;
use std::path::Path;

use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

/// Logs a dump of every thread each time SIGUSR1 arrives, until `token` is
/// cancelled.
pub async fn dump_on_signal(token: CancellationToken) {
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(usr1) => usr1,
        Err(e) => {
            error!("cannot listen for SIGUSR1: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = usr1.recv() => {
                if received.is_none() {
                    break;
                }
                let dump = tokio::task::spawn_blocking(|| thread_dump(Path::new("/proc/self/task")))
                    .await
                    .unwrap_or_else(|e| format!("thread dump failed: {e}"));
                info!("dump stacks:\n{dump}");
            }
        }
    }
}

/// Name, state and kernel stack of every thread under `task_dir`.
pub(crate) fn thread_dump(task_dir: &Path) -> String {
    let mut entries: Vec<_> = match std::fs::read_dir(task_dir) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(e) => return format!("cannot read {}: {e}", task_dir.display()),
    };
    entries.sort();

    let mut out = String::new();
    for task in entries {
        let tid = task
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = read_trimmed(&task.join("comm"));
        let state = std::fs::read_to_string(task.join("status"))
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|l| l.strip_prefix("State:").map(|s| s.trim().to_string()))
            })
            .unwrap_or_default();
        let _ = writeln!(out, "thread {tid} ({name}) {state}");
        match std::fs::read_to_string(task.join("stack")) {
            Ok(stack) => {
                for frame in stack.lines() {
                    let _ = writeln!(out, "    {frame}");
                }
            }
            Err(e) => {
                let _ = writeln!(out, "    <stack unavailable: {e}>");
            }
        }
    }
    out
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
