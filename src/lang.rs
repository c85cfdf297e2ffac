//! Facade over the language-intelligence worker process.
//!
//! The worker is a black box reached through newline-delimited JSON on its
//! stdio. Every request carries a unique `requestId`; replies resolve a
//! pending map with a 30 second timeout. Notifications the worker emits on
//! its own (`lsp_broadcast`, typically `textDocument/publishDiagnostics`)
//! are relayed to the bus as `lsp_update` events.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Notify},
};

use crate::bus::Broadcaster;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Restarts closer together than this mean the worker is hopeless; give up
/// instead of flapping.
const RESTART_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRequest<'a> {
    kind: &'a str,
    request_id: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerReply {
    kind: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

struct LangShared {
    worker_command: String,
    working_directory: PathBuf,
    broadcaster: Broadcaster,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    shutting_down: AtomicBool,
    shutdown_signal: Notify,
    last_restart: Mutex<Option<Instant>>,
}

pub struct LangFacade {
    shared: Arc<LangShared>,
}

impl LangFacade {
    /// Forks the worker and wires up its stdio pump.
    pub async fn start(
        worker_command: String,
        working_directory: PathBuf,
        broadcaster: Broadcaster,
    ) -> Result<Self, LangError> {
        let shared = Arc::new(LangShared {
            worker_command,
            working_directory,
            broadcaster,
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            last_restart: Mutex::new(None),
        });

        spawn_worker(&shared).await?;
        Ok(LangFacade { shared })
    }

    /// A facade with no live worker. Requests fail with `WorkerUnavailable`;
    /// used when the worker binary is missing so the rest of the sidecar
    /// still runs.
    pub fn disabled(broadcaster: Broadcaster) -> Self {
        LangFacade {
            shared: Arc::new(LangShared {
                worker_command: String::new(),
                working_directory: PathBuf::new(),
                broadcaster,
                stdin: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(true),
                shutdown_signal: Notify::new(),
                last_restart: Mutex::new(None),
            }),
        }
    }

    /// Sends one request frame and waits for the matching reply payload.
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value, LangError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();

        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), sender);

        let frame = serde_json::to_string(&WorkerRequest {
            kind,
            request_id: &request_id,
            payload: &payload,
        })
        .expect("worker request serialization cannot fail");

        if let Err(err) = self.send_line(&frame).await {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            // The pending map was drained by a worker restart.
            Ok(Err(_)) => Err(LangError::WorkerRestarted),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(LangError::Timeout { kind: kind.to_owned() })
            }
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), LangError> {
        let mut stdin = self.shared.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(LangError::WorkerUnavailable)?;
        stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|_| LangError::WorkerUnavailable)?;
        stdin.flush().await.map_err(|_| LangError::WorkerUnavailable)
    }

    /// Asks the worker to exit, escalating to a kill after the grace period.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let frame = json!({ "kind": "shutdown" }).to_string();
        let _ = self.send_line(&frame).await;
        self.shared.shutdown_signal.notify_waiters();
    }
}

fn spawn_worker(
    shared: &Arc<LangShared>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), LangError>> + Send + '_>> {
    Box::pin(spawn_worker_inner(shared))
}

async fn spawn_worker_inner(shared: &Arc<LangShared>) -> Result<(), LangError> {
    let mut parts = shared.worker_command.split_whitespace();
    let program = parts.next().ok_or(LangError::InvalidCommand)?;

    let mut child = Command::new(program)
        .args(parts)
        .current_dir(&shared.working_directory)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|source| LangError::Spawn {
            command: shared.worker_command.clone(),
            source,
        })?;

    let stdin = child.stdin.take().expect("worker stdin is piped");
    let stdout = child.stdout.take().expect("worker stdout is piped");
    *shared.stdin.lock().await = Some(stdin);

    // Reply pump: resolves pending requests and relays broadcasts.
    let reader_shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply: WorkerReply = match serde_json::from_str(&line) {
                Ok(reply) => reply,
                Err(err) => {
                    log::warn!("Undecodable worker frame dropped: {}", err);
                    continue;
                }
            };

            if reply.kind == "lsp_broadcast" {
                reader_shared.broadcaster.broadcast("lsp_update", reply.payload);
                continue;
            }

            if let Some(request_id) = &reply.request_id {
                let sender = reader_shared.pending.lock().unwrap().remove(request_id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(reply.payload);
                    }
                    None => {
                        log::debug!(
                            "Worker reply '{}' for unknown request {}",
                            reply.kind,
                            request_id
                        );
                    }
                }
            }
        }
    });

    // Exit monitor: restarts a crashed worker, kills a hung one on shutdown.
    let monitor_shared = Arc::clone(shared);
    tokio::spawn(async move {
        monitor_worker(monitor_shared, child).await;
    });

    // Prime the worker with its project context; the reply is informational.
    let init_frame = json!({
        "kind": "init_worker",
        "requestId": uuid::Uuid::new_v4().to_string(),
        "payload": {
            "workingDirectory": shared.working_directory.display().to_string(),
        },
    })
    .to_string();
    {
        let mut stdin = shared.stdin.lock().await;
        if let Some(stdin) = stdin.as_mut() {
            let _ = stdin.write_all(format!("{}\n", init_frame).as_bytes()).await;
            let _ = stdin.flush().await;
        }
    }

    log::info!("Language worker started: {}", shared.worker_command);
    Ok(())
}

async fn monitor_worker(shared: Arc<LangShared>, mut child: Child) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shared.shutdown_signal.notified() => {
            tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    log::warn!("Language worker ignored shutdown; killing it");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    *shared.stdin.lock().await = None;

    if shared.shutting_down.load(Ordering::SeqCst) {
        log::debug!("Language worker exited during shutdown");
        return;
    }

    let code = status.as_ref().ok().and_then(|status| status.code());
    if code == Some(0) {
        log::info!("Language worker exited cleanly");
        return;
    }

    log::warn!("Language worker died (status {:?}); restarting", code);
    reject_all_pending(&shared);

    {
        let mut last_restart = shared.last_restart.lock().unwrap();
        if let Some(previous) = *last_restart {
            if previous.elapsed() < RESTART_COOLDOWN {
                log::error!("Language worker keeps dying; not restarting again");
                return;
            }
        }
        *last_restart = Some(Instant::now());
    }

    if let Err(err) = spawn_worker(&shared).await {
        log::error!("Could not restart language worker: {}", err);
    }
}

/// Drops every pending sender, which surfaces as `WorkerRestarted` to the
/// callers awaiting them.
fn reject_all_pending(shared: &Arc<LangShared>) {
    let drained: Vec<_> = shared.pending.lock().unwrap().drain().collect();
    if !drained.is_empty() {
        log::warn!("Rejecting {} pending language requests", drained.len());
    }
}

#[derive(Debug, Error)]
pub enum LangError {
    #[error("LSP worker command is empty")]
    InvalidCommand,

    #[error("Could not start LSP worker '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("LSP worker is not running")]
    WorkerUnavailable,

    #[error("LSP worker restarted")]
    WorkerRestarted,

    #[error("LSP request '{kind}' timed out")]
    Timeout { kind: String },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn null_broadcaster() -> Broadcaster {
        Broadcaster::new(|_, _| {})
    }

    #[tokio::test]
    async fn request_resolves_against_matching_request_id() {
        // A stand-in worker that answers every request with a canned
        // jsonrpc_response for the same requestId.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo-worker.sh");
        fs_err::write(
            &script,
            "#!/bin/sh\nwhile read -r line; do\n  id=$(printf %s \"$line\" | sed -n 's/.*\"requestId\":\"\\([^\"]*\\)\".*/\\1/p')\n  if [ -n \"$id\" ]; then\n    printf '{\"kind\":\"jsonrpc_response\",\"requestId\":\"%s\",\"payload\":{\"ok\":true}}\\n' \"$id\"\n  fi\ndone\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let facade = LangFacade::start(
            script.display().to_string(),
            dir.path().to_path_buf(),
            null_broadcaster(),
        )
        .await
        .unwrap();

        let reply = facade
            .request("jsonrpc", json!({"method": "textDocument/hover"}))
            .await
            .unwrap();
        assert_eq!(reply["ok"], true);

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LangFacade::start(
            "definitely-not-a-real-worker-binary".to_owned(),
            dir.path().to_path_buf(),
            null_broadcaster(),
        )
        .await;

        assert!(matches!(result, Err(LangError::Spawn { .. })));
    }
}
