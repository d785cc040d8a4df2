//! Delegated Run Supervisor (§4.2).
//!
//! Drives one child process through `spawned -> running -> (aborting) ->
//! closing -> settled`. Four independent producers feed the state machine
//! — the stdout reader, the stderr reader, timers, and cancellation — and
//! all of them synchronize on a single mutex around state transitions, per
//! the "explicit tasks + channels" design note. The stdout reader owns
//! line buffering and is the only producer that creates [`ProgressMarker`]s.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::events::{parse_child_line, MarkerKind, ProgressMarker};
use crate::health::{HealthState, ToolKind};

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    Signal,
    Health,
    Budget,
    Policy,
    External,
}

/// Everything needed to spawn and watch a delegated child.
pub struct LaunchDescriptor {
    pub label: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub runtime_limit_ms: Option<u64>,
    pub force_kill_after_ms: u64,
    pub max_stderr_bytes: usize,
}

/// Terminal result of a supervised run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub aborted: bool,
    pub abort_origin: Option<AbortOrigin>,
    pub abort_reason: Option<String>,
    pub health_classification_stalled_or_wedged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Spawned,
    Running,
    Aborting,
    Closing,
    Settled,
}

struct SharedState {
    phase: Phase,
    abort_origin: Option<AbortOrigin>,
    abort_reason: Option<String>,
}

/// Drives a single delegated child process to completion.
pub struct Supervisor {
    health_policy: crate::config::HealthPolicy,
}

impl Supervisor {
    #[must_use]
    pub fn new(health_policy: crate::config::HealthPolicy) -> Self {
        Self { health_policy }
    }

    /// Run `descriptor` to completion. `cancel` is an externally-owned
    /// cancellation signal; if it is already triggered at entry the
    /// Supervisor transitions straight to `aborting(signal)` without
    /// spawning (§4.2 cancellation semantics).
    pub async fn run(&self, descriptor: LaunchDescriptor, mut cancel: mpsc::Receiver<()>) -> Outcome {
        if cancel.try_recv().is_ok() {
            return Outcome {
                exit_code: None,
                stderr: String::new(),
                aborted: true,
                abort_origin: Some(AbortOrigin::Signal),
                abort_reason: Some("cancelled before spawn".to_string()),
                health_classification_stalled_or_wedged: false,
            };
        }

        let mut command = Command::new(descriptor.argv.first().cloned().unwrap_or_default());
        command
            .args(descriptor.argv.iter().skip(1))
            .envs(&descriptor.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &descriptor.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Outcome {
                    exit_code: None,
                    stderr: err.to_string(),
                    aborted: true,
                    abort_origin: Some(AbortOrigin::External),
                    abort_reason: Some(format!("spawn failed: {err}")),
                    health_classification_stalled_or_wedged: false,
                };
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let shared = Arc::new(Mutex::new(SharedState {
            phase: Phase::Running,
            abort_origin: None,
            abort_reason: None,
        }));
        let health = Arc::new(Mutex::new(HealthState::new(now_ms())));

        let (abort_tx, mut abort_rx) = mpsc::channel::<(AbortOrigin, String)>(8);

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = tokio::spawn(collect_stderr(stderr, stderr_buf.clone(), descriptor.max_stderr_bytes));

        let stdout_task = tokio::spawn(stream_stdout(
            stdout,
            health.clone(),
            self.health_policy.clone(),
            abort_tx.clone(),
        ));

        let runtime_deadline = descriptor
            .runtime_limit_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let abort = tokio::select! {
            reason = abort_rx.recv() => reason,
            () = cancel_fired(&mut cancel) => Some((AbortOrigin::Signal, "external cancellation".to_string())),
            () = deadline_fired(runtime_deadline) => Some((AbortOrigin::Budget, "runtime limit exceeded".to_string())),
            status = child.wait() => {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                let stderr_text = Arc::try_unwrap(stderr_buf).map(Mutex::into_inner).unwrap_or_default();
                let health_stalled = matches!(
                    health.lock().await.classification,
                    crate::health::Classification::Stalled | crate::health::Classification::Wedged
                );
                return Outcome {
                    exit_code: status.ok().and_then(|s| s.code()),
                    stderr: stderr_text,
                    aborted: false,
                    abort_origin: None,
                    abort_reason: None,
                    health_classification_stalled_or_wedged: health_stalled,
                };
            }
        };

        {
            let mut state = shared.lock().await;
            state.phase = Phase::Aborting;
            state.abort_origin = abort.as_ref().map(|(origin, _)| *origin);
            state.abort_reason = abort.as_ref().map(|(_, reason)| reason.clone());
        }

        send_sigterm(&child);
        let grace = Duration::from_millis(descriptor.force_kill_after_ms);
        let status = tokio::time::timeout(grace, child.wait()).await;
        let status = match status {
            Ok(status) => status.ok(),
            Err(_) => {
                // SIGTERM did not land within the grace window; escalate.
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let stderr_text = Arc::try_unwrap(stderr_buf).map(Mutex::into_inner).unwrap_or_default();
        let health_stalled = matches!(
            health.lock().await.classification,
            crate::health::Classification::Stalled | crate::health::Classification::Wedged
        );

        Outcome {
            exit_code: status.and_then(|s| s.code()),
            stderr: stderr_text,
            aborted: true,
            abort_origin: abort.as_ref().map(|(origin, _)| *origin),
            abort_reason: abort.map(|(_, reason)| reason),
            health_classification_stalled_or_wedged: health_stalled,
        }
    }
}

/// Request a graceful shutdown. A `forceKillAfterMs` timer in the caller
/// escalates to `SIGKILL` via `Child::start_kill` if this does not land.
/// Shells out to `kill -TERM` rather than calling `libc::kill` directly,
/// since `unsafe_code` is forbidden workspace-wide; best-effort, a failure
/// here just means the escalation path fires sooner.
fn send_sigterm(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

async fn cancel_fired(cancel: &mut mpsc::Receiver<()>) {
    let _ = cancel.recv().await;
}

async fn deadline_fired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn collect_stderr(
    stderr: tokio::process::ChildStderr,
    buf: Arc<Mutex<String>>,
    max_bytes: usize,
) {
    let mut reader = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let mut guard = buf.lock().await;
        if guard.len() < max_bytes {
            guard.push_str(&line);
            guard.push('\n');
        }
    }
}

async fn stream_stdout(
    stdout: tokio::process::ChildStdout,
    health: Arc<Mutex<HealthState>>,
    health_policy: crate::config::HealthPolicy,
    abort_tx: mpsc::Sender<(AbortOrigin, String)>,
) {
    let mut reader = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let marker = parse_child_line(&line);
        let now = now_ms();
        let mut state = health.lock().await;
        let tool = marker_tool_kind(&marker);
        state.on_marker(now, tool, marker.fingerprint.as_deref());
        if let Some(reason) = state.evaluate(now, &health_policy) {
            let _ = abort_tx.send((AbortOrigin::Health, reason)).await;
        }
    }
}

fn marker_tool_kind(marker: &ProgressMarker) -> Option<ToolKind> {
    if matches!(marker.kind, MarkerKind::ToolStart) {
        marker.tool_name.as_deref().map(ToolKind::classify)
    } else {
        None
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
