//! The message bus: the WebSocket hub editor clients connect to, the
//! signature gate in front of every request, the dispatch pipeline, and the
//! event fan-out.

mod dispatch;
pub mod interface;

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use futures::{sink::SinkExt, stream::StreamExt};
use http_body_util::Full;
use hyper::{body::Incoming, header::CONTENT_TYPE, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_tungstenite::{is_upgrade_request, tungstenite::Message, upgrade, HyperWebsocket};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    sync::watch,
};
use uuid::Uuid;

use crate::{
    config::SharedConfig,
    desktop::DesktopPeer,
    fs_gateway::FsGateway,
    keys::{verify_with_der, KeyFetcher, KeyManager, LocalKeyStore, SignatureVerifier},
    lang::LangFacade,
};

use self::interface::{
    EventFrame, HostForward, HostInitParams, HostResponse, InitPayload, KeyRegisteredParams,
    RequestEnvelope, ResponseEnvelope, SERVER_VERSION, SOCKET_ENDPOINT,
};

/// How long a forwarded request may wait for the host agent's answer.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted clock skew on the `host_init` timestamp.
const HOST_INIT_MAX_SKEW: Duration = Duration::from_secs(300);

/// The narrow fan-out interface handed to components that need to push
/// events without holding the whole bus.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<dyn Fn(&str, Value) + Send + Sync>,
}

impl Broadcaster {
    pub fn new(f: impl Fn(&str, Value) + Send + Sync + 'static) -> Self {
        Broadcaster { inner: Arc::new(f) }
    }

    pub fn broadcast(&self, event_name: &str, payload: Value) {
        (self.inner.as_ref())(event_name, payload);
    }
}

struct ConnectionHandle {
    sender: UnboundedSender<Message>,
    opened_at: Instant,
}

/// All live editor/agent sockets, keyed by connection id.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, ConnectionHandle>>,
    host_agent: Mutex<Option<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: Mutex::new(HashMap::new()),
            host_agent: Mutex::new(None),
        }
    }

    fn insert(&self, id: Uuid, sender: UnboundedSender<Message>) {
        self.connections.lock().unwrap().insert(
            id,
            ConnectionHandle {
                sender,
                opened_at: Instant::now(),
            },
        );
    }

    /// Removes a connection; returns whether it was the host agent.
    fn remove(&self, id: Uuid) -> bool {
        if let Some(handle) = self.connections.lock().unwrap().remove(&id) {
            log::debug!(
                "Connection {} closed after {:.1?}",
                id,
                handle.opened_at.elapsed()
            );
        }

        let mut agent = self.host_agent.lock().unwrap();
        if *agent == Some(id) {
            *agent = None;
            true
        } else {
            false
        }
    }

    fn send_to(&self, id: Uuid, message: Message) -> bool {
        let connections = self.connections.lock().unwrap();
        match connections.get(&id) {
            // Sends are best-effort; a closed client just drops the frame.
            Some(handle) => handle.sender.send(message).is_ok(),
            None => false,
        }
    }

    fn set_host_agent(&self, id: Uuid) {
        let mut agent = self.host_agent.lock().unwrap();
        if let Some(previous) = *agent {
            log::warn!("Replacing host agent connection {} with {}", previous, id);
        }
        *agent = Some(id);
    }

    fn host_agent_id(&self) -> Option<Uuid> {
        *self.host_agent.lock().unwrap()
    }

    /// Fans an event frame out to every editor client (the host agent has
    /// its own channel and is skipped).
    pub fn broadcast(&self, event_name: &str, payload: Value) {
        let frame = EventFrame {
            event_name: event_name.to_owned(),
            payload,
        };
        let serialized = match serde_json::to_string(&frame) {
            Ok(serialized) => serialized,
            Err(err) => {
                log::error!("Could not serialize '{}' broadcast: {}", event_name, err);
                return;
            }
        };

        let agent = self.host_agent_id();
        let connections = self.connections.lock().unwrap();
        for (id, handle) in connections.iter() {
            if Some(*id) == agent {
                continue;
            }
            let _ = handle.sender.send(Message::text(serialized.clone()));
        }
    }

    fn close_all(&self) {
        let connections = self.connections.lock().unwrap();
        for handle in connections.values() {
            let _ = handle.sender.send(Message::Close(None));
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingForward {
    connection_id: Uuid,
    message_id: String,
    event_name: String,
    queued_at: Instant,
}

/// Everything the dispatch pipeline needs, shared across connections.
pub struct BusState {
    pub config: SharedConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<FsGateway>,
    pub key_store: Arc<LocalKeyStore>,
    pub key_manager: Arc<KeyManager>,
    pub key_fetcher: Arc<KeyFetcher>,
    pub verifier: SignatureVerifier,
    pub desktop: Arc<DesktopPeer>,
    pub lang: Arc<LangFacade>,
    pending_forwards: Mutex<HashMap<String, PendingForward>>,
}

impl BusState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<FsGateway>,
        key_store: Arc<LocalKeyStore>,
        key_manager: Arc<KeyManager>,
        key_fetcher: Arc<KeyFetcher>,
        desktop: Arc<DesktopPeer>,
        lang: Arc<LangFacade>,
    ) -> Self {
        let verifier = SignatureVerifier::new(Arc::clone(&key_manager));
        BusState {
            config,
            registry,
            gateway,
            key_store,
            key_manager,
            key_fetcher,
            verifier,
            desktop,
            lang,
            pending_forwards: Mutex::new(HashMap::new()),
        }
    }
}

pub struct MessageBus {
    state: Arc<BusState>,
    shutdown_sender: watch::Sender<bool>,
}

impl MessageBus {
    pub fn new(state: Arc<BusState>) -> Self {
        let (shutdown_sender, _) = watch::channel(false);
        MessageBus {
            state,
            shutdown_sender,
        }
    }

    pub fn state(&self) -> Arc<BusState> {
        Arc::clone(&self.state)
    }

    /// Binds the WebSocket endpoint and serves until [`MessageBus::stop`].
    /// A failed bind is fatal to startup.
    pub async fn serve(&self) -> Result<(), BusError> {
        let (host, port) = {
            let config = self.state.config.read().unwrap();
            (config.ws_host.clone(), config.ws_port)
        };

        let listener =
            TcpListener::bind((host.as_str(), port))
                .await
                .map_err(|source| BusError::Bind {
                    address: format!("{}:{}", host, port),
                    source,
                })?;

        log::info!("Message bus listening on ws://{}:{}{}", host, port, SOCKET_ENDPOINT);

        self.spawn_forward_sweeper();

        let mut shutdown = self.shutdown_sender.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::warn!("Accept failed: {}", err);
                            continue;
                        }
                    };

                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        let service = service_fn(move |request: Request<Incoming>| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(route(state, request)) }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            log::debug!("Error serving bus connection: {}", err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Message bus shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stops accepting, closes every client, and rejects pending forwards.
    pub fn stop(&self) {
        let _ = self.shutdown_sender.send(true);
        fail_pending_forwards(&self.state, |_| true, "bus shutting down");
        self.state.registry.close_all();
    }

    /// Periodically drops forwards the agent never answered, synthesizing a
    /// failure for the waiting client.
    fn spawn_forward_sweeper(&self) {
        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown_sender.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fail_pending_forwards(
                            &state,
                            |pending| pending.queued_at.elapsed() > FORWARD_TIMEOUT,
                            "Host agent request timed out",
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

fn route(state: Arc<BusState>, mut request: Request<Incoming>) -> Response<Full<Bytes>> {
    if request.uri().path() == SOCKET_ENDPOINT && is_upgrade_request(&request) {
        let (response, websocket) = match upgrade(&mut request, None) {
            Ok(upgraded) => upgraded,
            Err(err) => {
                log::warn!("WebSocket upgrade failed: {}", err);
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    format!("WebSocket upgrade failed: {}", err),
                );
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_socket(state, websocket).await {
                log::debug!("Socket connection ended with error: {}", err);
            }
        });

        return response;
    }

    let body = json!({ "error": format!("Route not found: {}", request.uri().path()) });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn plain_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message)))
        .unwrap()
}

/// Runs one client connection: registers it, greets it with `init`, then
/// pumps request frames until the socket closes.
async fn handle_socket(state: Arc<BusState>, websocket: HyperWebsocket) -> anyhow::Result<()> {
    let websocket = websocket.await?;
    let (mut sink, mut stream) = websocket.split();

    let connection_id = Uuid::new_v4();
    let (sender, mut receiver) = unbounded_channel::<Message>();
    state.registry.insert(connection_id, sender);
    log::debug!("Connection {} established", connection_id);

    // Writer half: everything addressed to this client funnels through one
    // task so concurrent handlers never interleave partial frames.
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
        let _ = sink.close().await;
    });

    let init = EventFrame {
        event_name: "init".to_owned(),
        payload: serde_json::to_value(InitPayload {
            key_ready: state.key_manager.current().is_some(),
            server_version: SERVER_VERSION.to_owned(),
        })?,
    };
    state
        .registry
        .send_to(connection_id, Message::text(serde_json::to_string(&init)?));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&state, connection_id, text.as_str());
            }
            Ok(Message::Binary(_)) => {
                log::warn!("Binary frame dropped; the bus speaks JSON text frames");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // tungstenite answers pings on its own.
            }
            Ok(Message::Frame(_)) => unreachable!(),
            Err(err) => {
                log::debug!("WebSocket error on {}: {}", connection_id, err);
                break;
            }
        }
    }

    let was_agent = state.registry.remove(connection_id);
    if was_agent {
        log::warn!("Host agent disconnected");
        fail_pending_forwards(&state, |_| true, "Host agent disconnected");
    }
    writer.abort();

    Ok(())
}

/// Routes one inbound JSON frame. Protocol failures are logged and dropped;
/// they never produce a response frame.
fn handle_frame(state: &Arc<BusState>, connection_id: Uuid, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Malformed frame dropped: {}", err);
            return;
        }
    };

    let Some(event_name) = value
        .get("event_name")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        log::warn!("Frame without event_name dropped");
        return;
    };
    let event_name = event_name.as_str();

    match event_name {
        "key_registered" => {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<KeyRegisteredParams>(params) {
                Ok(params) => state.key_fetcher.start_fetching(params.uuid),
                Err(err) => log::warn!("Bad key_registered params dropped: {}", err),
            }
        }
        "host_init" => handle_host_init(state, connection_id, &value),
        "host_response" => handle_host_response(state, connection_id, value),
        "host_broadcast" => handle_host_broadcast(state, connection_id, value),
        _ => {
            let envelope: RequestEnvelope = match serde_json::from_value(value) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::warn!("Undecodable '{}' envelope dropped: {}", event_name, err);
                    return;
                }
            };

            let insecure = state.config.read().unwrap().insecure;
            if !insecure {
                let Some(signature) = envelope.signature.as_deref() else {
                    log::warn!("Unsigned '{}' request dropped", event_name);
                    return;
                };
                if !state.verifier.verify(
                    &envelope.event_name,
                    &envelope.params,
                    &envelope.message_id,
                    signature,
                ) {
                    log::warn!("Request '{}' failed signature verification", event_name);
                    return;
                }
            }

            let state = Arc::clone(state);
            tokio::spawn(async move {
                dispatch::dispatch(state, connection_id, envelope).await;
            });
        }
    }
}

/// The host agent's handshake: a `host_init` envelope signed with the
/// project's own private key.
fn handle_host_init(state: &Arc<BusState>, connection_id: Uuid, value: &Value) {
    let accepted = check_host_init(state, value);

    if accepted {
        state.registry.set_host_agent(connection_id);
        log::info!("Host agent connected ({})", connection_id);
        send_event(state, connection_id, "host_init_ack", json!({}));
    } else {
        log::warn!("Rejected host_init from {}", connection_id);
        send_event(state, connection_id, "host_init_rejected", json!({}));
        state
            .registry
            .send_to(connection_id, Message::Close(None));
    }
}

fn check_host_init(state: &Arc<BusState>, value: &Value) -> bool {
    let envelope: RequestEnvelope = match serde_json::from_value(value.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("Undecodable host_init: {}", err);
            return false;
        }
    };

    let params: HostInitParams = match serde_json::from_value(envelope.params.clone()) {
        Ok(params) => params,
        Err(err) => {
            log::warn!("Bad host_init params: {}", err);
            return false;
        }
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let skew = now.abs_diff(params.timestamp);
    if skew > HOST_INIT_MAX_SKEW.as_millis() as u64 {
        log::warn!("host_init timestamp skew too large ({} ms)", skew);
        return false;
    }

    let Some(signature) = envelope.signature.as_deref() else {
        log::warn!("Unsigned host_init");
        return false;
    };

    let der_base64 = match state.key_store.public_key_der() {
        Ok(der) => der,
        Err(err) => {
            log::warn!("No project public key for host_init check: {}", err);
            return false;
        }
    };
    let der = match data_encoding::BASE64.decode(der_base64.as_bytes()) {
        Ok(der) => der,
        Err(err) => {
            log::warn!("Project public key is not valid base64: {}", err);
            return false;
        }
    };

    match verify_with_der(
        &der,
        &envelope.event_name,
        &envelope.params,
        &envelope.message_id,
        signature,
    ) {
        Ok(valid) => valid,
        Err(err) => {
            log::warn!("host_init verification error: {}", err);
            false
        }
    }
}

/// Unwraps an agent answer and forwards the inner response to the client
/// that originated the request. First response wins; the rest are dropped.
fn handle_host_response(state: &Arc<BusState>, connection_id: Uuid, value: Value) {
    if state.registry.host_agent_id() != Some(connection_id) {
        log::warn!("host_response from non-agent connection dropped");
        return;
    }

    let response: HostResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("Undecodable host_response dropped: {}", err);
            return;
        }
    };

    let pending = state
        .pending_forwards
        .lock()
        .unwrap()
        .remove(&response.request_uuid);

    let Some(pending) = pending else {
        log::debug!(
            "host_response for unknown or already-answered forward {} dropped",
            response.request_uuid
        );
        return;
    };

    match serde_json::to_string(&response.wrapped_response) {
        Ok(serialized) => {
            state
                .registry
                .send_to(pending.connection_id, Message::text(serialized));
        }
        Err(err) => {
            log::error!("Could not serialize host response: {}", err);
            respond_forward_failure(state, &pending, "Host response was undecodable");
        }
    }
}

fn handle_host_broadcast(state: &Arc<BusState>, connection_id: Uuid, value: Value) {
    if state.registry.host_agent_id() != Some(connection_id) {
        log::warn!("host_broadcast from non-agent connection dropped");
        return;
    }

    match serde_json::from_value::<interface::HostBroadcast>(value) {
        Ok(broadcast) => {
            state
                .registry
                .broadcast(&broadcast.wrapped_event.event_name, broadcast.wrapped_event.payload);
        }
        Err(err) => log::warn!("Undecodable host_broadcast dropped: {}", err),
    }
}

/// Wraps a request for the host agent, remembering who asked.
pub(crate) fn forward_to_host(
    state: &Arc<BusState>,
    connection_id: Uuid,
    envelope: RequestEnvelope,
) {
    let Some(agent_id) = state.registry.host_agent_id() else {
        let failure = synthesized_failure(
            &envelope.event_name,
            &envelope.message_id,
            "Host agent is not connected",
        );
        state.registry.send_to(connection_id, failure);
        return;
    };

    let request_uuid = Uuid::new_v4().to_string();
    let workspace_dir = {
        let config = state.config.read().unwrap();
        config.working_directory.display().to_string()
    };

    let pending = PendingForward {
        connection_id,
        message_id: envelope.message_id.clone(),
        event_name: envelope.event_name.clone(),
        queued_at: Instant::now(),
    };

    let forward = HostForward {
        event_name: "host_forward".to_owned(),
        request_uuid: request_uuid.clone(),
        workspace_dir,
        wrapped_request: envelope,
    };

    let serialized = match serde_json::to_string(&forward) {
        Ok(serialized) => serialized,
        Err(err) => {
            log::error!("Could not serialize host_forward: {}", err);
            respond_forward_failure(state, &pending, "Could not reach host agent");
            return;
        }
    };

    state
        .pending_forwards
        .lock()
        .unwrap()
        .insert(request_uuid.clone(), pending);

    if !state.registry.send_to(agent_id, Message::text(serialized)) {
        if let Some(pending) = state.pending_forwards.lock().unwrap().remove(&request_uuid) {
            respond_forward_failure(state, &pending, "Host agent is not connected");
        }
    }
}

/// Fails every pending forward matching `predicate` with a synthesized
/// error payload.
fn fail_pending_forwards(
    state: &Arc<BusState>,
    predicate: impl Fn(&PendingForward) -> bool,
    reason: &str,
) {
    let expired: Vec<PendingForward> = {
        let mut pending = state.pending_forwards.lock().unwrap();
        let uuids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(uuid, _)| uuid.clone())
            .collect();
        uuids
            .into_iter()
            .filter_map(|uuid| pending.remove(&uuid))
            .collect()
    };

    for entry in expired {
        respond_forward_failure(state, &entry, reason);
    }
}

fn respond_forward_failure(state: &Arc<BusState>, pending: &PendingForward, reason: &str) {
    let failure = synthesized_failure(&pending.event_name, &pending.message_id, reason);
    state.registry.send_to(pending.connection_id, failure);
}

fn synthesized_failure(event_name: &str, message_id: &str, reason: &str) -> Message {
    let envelope = ResponseEnvelope {
        event_response: event_name.to_owned(),
        message_id: message_id.to_owned(),
        payload: json!({
            "response": { "success": false, "error": reason },
        }),
    };
    Message::text(serde_json::to_string(&envelope).expect("response serialization cannot fail"))
}

fn send_event(state: &Arc<BusState>, connection_id: Uuid, event_name: &str, payload: Value) {
    let frame = EventFrame {
        event_name: event_name.to_owned(),
        payload,
    };
    match serde_json::to_string(&frame) {
        Ok(serialized) => {
            state
                .registry
                .send_to(connection_id, Message::text(serialized));
        }
        Err(err) => log::error!("Could not serialize '{}' event: {}", event_name, err),
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Could not bind the WebSocket endpoint at {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::path::Path;

    use futures::stream::{SplitSink, SplitStream};
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    use crate::{
        config,
        desktop::DesktopPeer,
        fs_gateway::FsGateway,
        keys::{sign_request, KeyFetcher, KeyManager, KeyRecord, LocalKeyStore},
        lang::LangFacade,
    };

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestBus {
        port: u16,
        editor_key: SigningKey,
        key_store: Arc<LocalKeyStore>,
        #[allow(unused)]
        bus: Arc<MessageBus>,
    }

    async fn start_test_bus(dir: &Path) -> TestBus {
        let port = {
            let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut bare = crate::Config::defaults(dir.to_path_buf());
        bare.ws_host = "127.0.0.1".to_owned();
        bare.ws_port = port;
        let config = config::shared(bare);

        let registry = Arc::new(ConnectionRegistry::new());
        let gateway = Arc::new(FsGateway::new(Arc::clone(&config)));
        let key_store = Arc::new(LocalKeyStore::new(dir));
        let key_manager = Arc::new(KeyManager::new());
        let key_fetcher = Arc::new(KeyFetcher::new(
            Arc::clone(&key_manager),
            "http://127.0.0.1:9/keys".to_owned(),
        ));
        let desktop = Arc::new(
            DesktopPeer::start(dir.join("desktop.sock"), Box::new(|| {}), Box::new(|_| {}))
                .await
                .unwrap(),
        );
        let lang = Arc::new(LangFacade::disabled(Broadcaster::new(|_, _| {})));

        let editor_key = SigningKey::random(&mut rand::rngs::OsRng);
        key_manager.set_current_key(KeyRecord {
            uuid: "test-key".to_owned(),
            public_key_der: editor_key
                .verifying_key()
                .to_public_key_der()
                .unwrap()
                .into_vec(),
            expiration_time: u64::MAX,
        });

        let state = Arc::new(BusState::new(
            config,
            registry,
            gateway,
            Arc::clone(&key_store),
            key_manager,
            key_fetcher,
            desktop,
            lang,
        ));
        let bus = Arc::new(MessageBus::new(state));

        let serving = Arc::clone(&bus);
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });

        // Wait for the listener to come up.
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestBus {
            port,
            editor_key,
            key_store,
            bus,
        }
    }

    async fn connect(port: u16) -> Socket {
        let (socket, _) = connect_async(format!("ws://127.0.0.1:{}/jsx-tool-socket", port))
            .await
            .unwrap();
        socket
    }

    async fn next_json(stream: &mut SplitStream<Socket>) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send_signed(
        sink: &mut SplitSink<Socket, WsMessage>,
        key: &SigningKey,
        event_name: &str,
        params: Value,
        message_id: &str,
    ) {
        let signature = sign_request(key, event_name, &params, message_id);
        let frame = json!({
            "event_name": event_name,
            "params": params,
            "signature": signature,
            "message_id": message_id,
        });
        sink.send(WsMessage::text(frame.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn signed_read_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs_err::create_dir_all(root.join("src")).unwrap();
        fs_err::write(root.join("src/app.tsx"), "export const App = 1;\n").unwrap();

        let test_bus = start_test_bus(&root).await;
        let (mut sink, mut stream) = connect(test_bus.port).await.split();

        let init = next_json(&mut stream).await;
        assert_eq!(init["event_name"], "init");
        assert_eq!(init["payload"]["keyReady"], true);

        send_signed(
            &mut sink,
            &test_bus.editor_key,
            "read_file",
            json!({"filePath": "src/app.tsx"}),
            "m1",
        )
        .await;

        let response = next_json(&mut stream).await;
        assert_eq!(response["event_response"], "read_file");
        assert_eq!(response["message_id"], "m1");
        assert_eq!(response["payload"]["filePath"], "src/app.tsx");
        assert_eq!(response["payload"]["response"]["success"], true);
        assert_eq!(
            response["payload"]["response"]["data"],
            "export const App = 1;\n"
        );
    }

    #[tokio::test]
    async fn escape_attempts_fail_and_bad_signatures_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs_err::write(root.join("ok.ts"), "fine").unwrap();

        let test_bus = start_test_bus(&root).await;
        let (mut sink, mut stream) = connect(test_bus.port).await.split();
        let _init = next_json(&mut stream).await;

        // A validly-signed escape attempt gets a payload-level failure.
        send_signed(
            &mut sink,
            &test_bus.editor_key,
            "read_file",
            json!({"filePath": "../../etc/passwd"}),
            "m2",
        )
        .await;

        let response = next_json(&mut stream).await;
        assert_eq!(response["message_id"], "m2");
        assert_eq!(response["payload"]["response"]["success"], false);
        assert!(response["payload"]["response"]["error"]
            .as_str()
            .unwrap()
            .contains("Path must be within working directory"));

        // A tampered frame is dropped entirely: the next response belongs to
        // the following (valid) request.
        let params = json!({"filePath": "ok.ts"});
        let signature = sign_request(&test_bus.editor_key, "read_file", &params, "m3");
        let forged = json!({
            "event_name": "read_file",
            "params": {"filePath": "../forged.ts"},
            "signature": signature,
            "message_id": "m3",
        });
        sink.send(WsMessage::text(forged.to_string())).await.unwrap();

        send_signed(&mut sink, &test_bus.editor_key, "exists", params, "m4").await;
        let response = next_json(&mut stream).await;
        assert_eq!(response["event_response"], "exists");
        assert_eq!(response["message_id"], "m4");
        assert_eq!(response["payload"]["response"]["data"], true);
    }

    #[tokio::test]
    async fn host_forward_pairs_request_and_response() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let test_bus = start_test_bus(&root).await;

        // The agent authenticates with the project keypair.
        let agent_key = test_bus.key_store.signing_key().unwrap();
        let (mut agent_sink, mut agent_stream) = connect(test_bus.port).await.split();
        let _init = next_json(&mut agent_stream).await;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        send_signed(
            &mut agent_sink,
            &agent_key,
            "host_init",
            json!({"timestamp": timestamp}),
            "h1",
        )
        .await;

        let ack = next_json(&mut agent_stream).await;
        assert_eq!(ack["event_name"], "host_init_ack");

        // An editor client asks for git status, which is host-forwarded.
        let (mut sink, mut stream) = connect(test_bus.port).await.split();
        let _init = next_json(&mut stream).await;
        send_signed(
            &mut sink,
            &test_bus.editor_key,
            "get_git_status",
            json!({}),
            "g1",
        )
        .await;

        let forward = next_json(&mut agent_stream).await;
        assert_eq!(forward["event_name"], "host_forward");
        assert_eq!(forward["wrapped_request"]["event_name"], "get_git_status");
        assert_eq!(forward["wrapped_request"]["message_id"], "g1");
        let request_uuid = forward["request_uuid"].as_str().unwrap();

        let reply = json!({
            "event_name": "host_response",
            "request_uuid": request_uuid,
            "wrapped_response": {
                "event_response": "get_git_status",
                "message_id": "g1",
                "payload": {"isGitRepo": true, "statusInfo": {"files": []}},
            },
        });
        agent_sink
            .send(WsMessage::text(reply.to_string()))
            .await
            .unwrap();

        let response = next_json(&mut stream).await;
        assert_eq!(response["event_response"], "get_git_status");
        assert_eq!(response["message_id"], "g1");
        assert_eq!(response["payload"]["isGitRepo"], true);

        // A duplicate answer for the same uuid is dropped, not re-delivered.
        agent_sink
            .send(WsMessage::text(reply.to_string()))
            .await
            .unwrap();

        send_signed(&mut sink, &test_bus.editor_key, "get_version", json!({}), "v1").await;
        let response = next_json(&mut stream).await;
        assert_eq!(response["event_response"], "get_version");
    }

    #[tokio::test]
    async fn forwarding_without_an_agent_synthesizes_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let test_bus = start_test_bus(&root).await;
        let (mut sink, mut stream) = connect(test_bus.port).await.split();
        let _init = next_json(&mut stream).await;

        send_signed(
            &mut sink,
            &test_bus.editor_key,
            "run_terminal_command",
            json!({"command": "echo hi"}),
            "t1",
        )
        .await;

        let response = next_json(&mut stream).await;
        assert_eq!(response["event_response"], "run_terminal_command");
        assert_eq!(response["message_id"], "t1");
        assert_eq!(response["payload"]["response"]["success"], false);
        assert!(response["payload"]["response"]["error"]
            .as_str()
            .unwrap()
            .contains("not connected"));
    }
}
