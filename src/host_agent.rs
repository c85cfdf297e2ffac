//! The host agent: an outbound tunnel from the developer's machine into the
//! bus.
//!
//! The sidecar usually runs inside a container whose filesystem is not the
//! one the developer's editor and terminals live on. The agent dials the bus
//! as a WebSocket client, authenticates by signing `host_init` with the
//! project keypair, and then answers the subset of requests that must touch
//! the real host: git status, clipboard, file imports, and every terminal
//! command. Paths are rewritten in both directions so each side only ever
//! sees its own workspace root.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::{
    bus::interface::{
        CopyToClipboardParams, CreateTerminalParams, EventFrame, GetTerminalLogsParams,
        HostBroadcast, HostForward, HostResponse, ImportItemsParams, RequestEnvelope,
        ResizeTerminalParams, ResponseEnvelope, RunTerminalCommandParams, SendTerminalInputParams,
        SessionIdParams, TerminalSessionPayload, OpResult, SOCKET_ENDPOINT,
    },
    fs_gateway::FsGateway,
    keys::{sign_request, LocalKeyStore},
    path_translate::translate_value,
    pty::{PtyEvent, PtyEventListener, PtyManager},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct AgentShared {
    bus_url: String,
    /// Host-side project root; the other end of the path translation.
    workspace: PathBuf,
    key_store: Arc<LocalKeyStore>,
    gateway: Arc<FsGateway>,
    pty: Arc<PtyManager>,
    outgoing: Mutex<Option<UnboundedSender<Message>>>,
    shutting_down: AtomicBool,
}

impl AgentShared {
    fn send(&self, message: Message) {
        if let Some(sender) = self.outgoing.lock().unwrap().as_ref() {
            let _ = sender.send(message);
        }
    }

    fn send_json<T: serde::Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(serialized) => self.send(Message::text(serialized)),
            Err(err) => log::error!("Could not serialize agent frame: {}", err),
        }
    }
}

pub struct HostAgent {
    shared: Arc<AgentShared>,
}

impl HostAgent {
    /// Builds an agent serving `workspace` against the bus at `bus_url`
    /// (scheme and authority; the socket path is appended).
    pub fn new(
        bus_url: String,
        workspace: PathBuf,
        key_store: Arc<LocalKeyStore>,
        gateway: Arc<FsGateway>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<AgentShared>| {
            let listener_weak = weak.clone();
            let listener: PtyEventListener = Arc::new(move |event| {
                if let Some(shared) = listener_weak.upgrade() {
                    forward_pty_event(&shared, event);
                }
            });

            AgentShared {
                bus_url,
                workspace: workspace.clone(),
                key_store,
                gateway,
                pty: Arc::new(PtyManager::new(workspace.clone(), listener)),
                outgoing: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }
        });

        HostAgent { shared }
    }

    /// Dials the bus and keeps the tunnel open, reconnecting after a fixed
    /// delay on any disconnect until [`HostAgent::stop`] is called.
    pub async fn run(&self) -> Result<(), AgentError> {
        let url = format!(
            "{}{}",
            self.shared.bus_url.trim_end_matches('/'),
            SOCKET_ENDPOINT
        );

        loop {
            if self.shared.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            match connect_async(&url).await {
                Ok((websocket, _)) => {
                    log::info!("Connected to bus at {}", url);
                    if let Err(err) = self.serve_connection(websocket).await {
                        log::warn!("Tunnel closed: {}", err);
                    }
                }
                Err(err) => {
                    log::warn!("Could not reach bus at {}: {}", url, err);
                }
            }

            if self.shared.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            log::debug!("Reconnecting in {:?}", RECONNECT_DELAY);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }

        Ok(())
    }

    /// Suppresses reconnection and closes the live socket.
    pub fn stop(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.send(Message::Close(None));
        self.shared.pty.kill_all();
    }

    async fn serve_connection(
        &self,
        websocket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<(), AgentError> {
        let (mut sink, mut stream) = websocket.split();

        let (sender, mut receiver) = unbounded_channel::<Message>();
        *self.shared.outgoing.lock().unwrap() = Some(sender);

        let writer = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        self.send_host_init()?;

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    log::debug!("Tunnel read error: {}", err);
                    break;
                }
            }
        }

        *self.shared.outgoing.lock().unwrap() = None;
        writer.abort();
        Ok(())
    }

    fn send_host_init(&self) -> Result<(), AgentError> {
        let signing_key = self
            .shared
            .key_store
            .signing_key()
            .map_err(|err| AgentError::Key {
                message: err.to_string(),
            })?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let params = json!({ "timestamp": timestamp });
        let message_id = Uuid::new_v4().to_string();
        let signature = sign_request(&signing_key, "host_init", &params, &message_id);

        self.shared.send_json(&RequestEnvelope {
            event_name: "host_init".to_owned(),
            params,
            signature: Some(signature),
            message_id,
        });
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("Malformed frame from bus dropped: {}", err);
                return;
            }
        };

        match value.get("event_name").and_then(Value::as_str) {
            Some("host_init_ack") => {
                log::info!("Bus accepted host_init; serving host requests");
            }
            Some("host_init_rejected") => {
                log::error!("Bus rejected host_init; check that both sides share the project keypair");
            }
            Some("host_forward") => match serde_json::from_value::<HostForward>(value) {
                Ok(forward) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        handle_forward(shared, forward).await;
                    });
                }
                Err(err) => log::warn!("Undecodable host_forward dropped: {}", err),
            },
            Some(other) => log::debug!("Ignoring bus event '{}'", other),
            None => log::warn!("Frame without event_name dropped"),
        }
    }
}

async fn handle_forward(shared: Arc<AgentShared>, forward: HostForward) {
    let dev_root = forward.workspace_dir.clone();
    let host_root = shared.workspace.display().to_string();

    let mut request = forward.wrapped_request;
    // Inbound params carry dev-workspace paths; rewrite them to host paths.
    request.params = translate_value(request.params, &dev_root, &host_root);

    let payload = handle_request(&shared, &request).await;
    // Outbound payloads carry host paths; rewrite them back to dev paths.
    let payload = translate_value(payload, &host_root, &dev_root);

    shared.send_json(&HostResponse {
        event_name: "host_response".to_owned(),
        request_uuid: forward.request_uuid,
        wrapped_response: ResponseEnvelope {
            event_response: request.event_name,
            message_id: request.message_id,
            payload,
        },
    });
}

async fn handle_request(shared: &Arc<AgentShared>, request: &RequestEnvelope) -> Value {
    let params = request.params.clone();

    match request.event_name.as_str() {
        "get_git_status" => {
            let gateway = Arc::clone(&shared.gateway);
            match tokio::task::spawn_blocking(move || gateway.git_status()).await {
                Ok(payload) => to_value(payload),
                Err(err) => failure(format!("git status handler panicked: {}", err)),
            }
        }
        "copy_to_clipboard" => match parse::<CopyToClipboardParams>(params) {
            Ok(p) => match copy_to_clipboard(&p.text).await {
                Ok(()) => json!({ "response": { "success": true } }),
                Err(message) => failure(message),
            },
            Err(message) => failure(message),
        },
        "import_items" => match parse::<ImportItemsParams>(params) {
            Ok(p) => import_items(shared, &p),
            Err(message) => failure(message),
        },
        "create_terminal_session" => match parse::<CreateTerminalParams>(params) {
            Ok(p) => {
                match shared.pty.create_session(
                    p.shell.as_deref(),
                    &p.args,
                    p.cols,
                    p.rows,
                    &p.env,
                ) {
                    Ok(session_id) => to_value(TerminalSessionPayload {
                        session_id,
                        response: OpResult::done(),
                    }),
                    Err(err) => failure(err.to_string()),
                }
            }
            Err(message) => failure(message),
        },
        "send_terminal_input" => match parse::<SendTerminalInputParams>(params) {
            Ok(p) => match shared.pty.write_input(&p.session_id, &p.input) {
                Ok(()) => json!({ "response": { "success": true } }),
                Err(err) => failure(err.to_string()),
            },
            Err(message) => failure(message),
        },
        "resize_terminal_session" => match parse::<ResizeTerminalParams>(params) {
            Ok(p) => match shared.pty.resize(&p.session_id, p.cols, p.rows) {
                Ok(()) => json!({ "response": { "success": true } }),
                Err(err) => failure(err.to_string()),
            },
            Err(message) => failure(message),
        },
        "get_terminal_logs" => match parse::<GetTerminalLogsParams>(params) {
            Ok(p) => match shared.pty.get_logs(&p.session_id, p.cursor) {
                Some(payload) => to_value(payload),
                None => failure(format!("Unknown terminal session {}", p.session_id)),
            },
            Err(message) => failure(message),
        },
        "kill_terminal_session" => match parse::<SessionIdParams>(params) {
            Ok(p) => match shared.pty.kill(&p.session_id) {
                Ok(()) => json!({ "response": { "success": true } }),
                Err(err) => failure(err.to_string()),
            },
            Err(message) => failure(message),
        },
        "run_terminal_command" => match parse::<RunTerminalCommandParams>(params) {
            Ok(p) => to_value(shared.pty.run_one_off_command(&p.command).await),
            Err(message) => failure(message),
        },
        other => failure(format!("Unsupported host operation '{}'", other)),
    }
}

/// Relays PTY lifecycle events to the bus for fan-out to editor clients.
fn forward_pty_event(shared: &Arc<AgentShared>, event: PtyEvent) {
    let (event_name, payload) = match event {
        PtyEvent::SessionCreated { session_id } => (
            "terminal_session_created",
            json!({ "sessionId": session_id }),
        ),
        PtyEvent::Data { session_id } => (
            "terminal_output_available",
            json!({ "sessionId": session_id }),
        ),
        PtyEvent::Exit {
            session_id,
            exit_code,
            signal,
        } => (
            "terminal_session_closed",
            json!({ "sessionId": session_id, "exitCode": exit_code, "signal": signal }),
        ),
    };

    shared.send_json(&HostBroadcast {
        event_name: "host_broadcast".to_owned(),
        wrapped_event: EventFrame {
            event_name: event_name.to_owned(),
            payload,
        },
    });
}

/// Copies files or directories from elsewhere on the host into the
/// project's `imported/` directory, returning the created paths.
fn import_items(shared: &Arc<AgentShared>, params: &ImportItemsParams) -> Value {
    let import_dir = shared.workspace.join("imported");
    if let Err(err) = fs_err::create_dir_all(&import_dir) {
        return failure(err.to_string());
    }

    let mut imported: Vec<String> = Vec::new();
    for item in &params.items {
        let source = PathBuf::from(&item.source_path);
        let name = item
            .target_name
            .clone()
            .or_else(|| {
                source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "imported-item".to_owned());
        let target = import_dir.join(&name);

        let result = if source.is_dir() {
            copy_dir_recursive(&source, &target)
        } else {
            fs_err::copy(&source, &target).map(|_| ())
        };

        match result {
            Ok(()) => imported.push(target.display().to_string()),
            Err(err) => {
                return failure(format!("Could not import {}: {}", item.source_path, err))
            }
        }
    }

    json!({ "response": { "success": true, "data": imported } })
}

fn copy_dir_recursive(source: &PathBuf, target: &PathBuf) -> std::io::Result<()> {
    fs_err::create_dir_all(target)?;
    for entry in fs_err::read_dir(source)? {
        let entry = entry?;
        let entry_target = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &entry_target)?;
        } else {
            fs_err::copy(entry.path(), entry_target)?;
        }
    }
    Ok(())
}

/// Pipes text into the platform clipboard command.
async fn copy_to_clipboard(text: &str) -> Result<(), String> {
    use tokio::io::AsyncWriteExt;

    let candidates: &[(&str, &[&str])] = if cfg!(target_os = "macos") {
        &[("pbcopy", &[])]
    } else if cfg!(windows) {
        &[("clip", &[])]
    } else {
        &[
            ("wl-copy", &[]),
            ("xclip", &["-selection", "clipboard"]),
            ("xsel", &["--clipboard", "--input"]),
        ]
    };

    let mut last_error = "no clipboard command available".to_owned();
    for (program, args) in candidates {
        let spawned = tokio::process::Command::new(program)
            .args(*args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                last_error = format!("{}: {}", program, err);
                continue;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(text.as_bytes()).await {
                last_error = format!("{}: {}", program, err);
                continue;
            }
            drop(stdin);
        }

        match child.wait().await {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => last_error = format!("{} exited with {}", program, status),
            Err(err) => last_error = format!("{}: {}", program, err),
        }
    }

    Err(format!("Could not copy to clipboard: {}", last_error))
}

fn parse<P: serde::de::DeserializeOwned>(params: Value) -> Result<P, String> {
    serde_json::from_value(params).map_err(|err| format!("Invalid params: {}", err))
}

fn failure(message: String) -> Value {
    json!({ "response": { "success": false, "error": message } })
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Key store failure: {message}")]
    Key { message: String },
}
