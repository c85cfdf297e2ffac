//! The local IPC socket shared with the native desktop application.
//!
//! Exactly one process on the machine holds the listening end. Whoever
//! starts first becomes the server; later processes connect as clients, and
//! a stale socket file left by a crashed server is unlinked and taken over.
//! Frames are newline-delimited JSON in both directions.

use std::{
    collections::HashMap,
    env,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

const SOCKET_NAME: &str = "jsx-tool-desktop";
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Platform-dependent rendezvous path for the desktop socket.
pub fn default_socket_path() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{}-sock", SOCKET_NAME))
    }

    #[cfg(unix)]
    {
        let file_name = format!("{}.sock", SOCKET_NAME);

        if let Some(runtime_dir) = env::var_os("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime_dir).join(file_name);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".jsx-tool").join(file_name);
        }
        PathBuf::from("/tmp").join(file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Server,
    Client,
    None,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Server => "server",
            PeerRole::Client => "client",
            PeerRole::None => "none",
        }
    }
}

pub type PeerChangeListener = Box<dyn Fn() + Send + Sync>;
pub type PeerMessageListener = Box<dyn Fn(Value) + Send + Sync>;

struct PeerShared {
    socket_path: PathBuf,
    role: Mutex<PeerRole>,
    /// Live peers by internal id. Servers hold every accepted connection;
    /// clients hold at most the single upstream connection.
    peers: Mutex<HashMap<u64, UnboundedSender<String>>>,
    next_peer_id: Mutex<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_change: PeerChangeListener,
    on_message: PeerMessageListener,
}

pub struct DesktopPeer {
    shared: Arc<PeerShared>,
}

impl DesktopPeer {
    /// Connects to an existing desktop socket or claims it as server.
    pub async fn start(
        socket_path: PathBuf,
        on_change: PeerChangeListener,
        on_message: PeerMessageListener,
    ) -> Result<Self, DesktopError> {
        let shared = Arc::new(PeerShared {
            socket_path,
            role: Mutex::new(PeerRole::None),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: Mutex::new(0),
            tasks: Mutex::new(Vec::new()),
            on_change,
            on_message,
        });

        let peer = DesktopPeer {
            shared: Arc::clone(&shared),
        };
        peer.negotiate().await?;
        Ok(peer)
    }

    pub fn role(&self) -> PeerRole {
        *self.shared.role.lock().unwrap()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().unwrap().len()
    }

    /// Sends one JSON line to every connected peer (server) or to the
    /// upstream server (client). Silently does nothing when not connected.
    pub fn broadcast(&self, message: &Value) {
        let line = format!("{}\n", message);
        let peers = self.shared.peers.lock().unwrap();
        for sender in peers.values() {
            let _ = sender.send(line.clone());
        }
    }

    /// Destroys peers, stops the listener, and removes the socket file.
    pub async fn close(&self) {
        let previous_role = {
            let mut role = self.shared.role.lock().unwrap();
            let previous = *role;
            if previous == PeerRole::None {
                return;
            }
            *role = PeerRole::None;
            previous
        };

        self.shared.peers.lock().unwrap().clear();

        // Writer/reader tasks notice their channels closing; anything still
        // alive after the grace period is torn down hard.
        tokio::time::sleep(BIND_RETRY_DELAY).await;
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        // Only the listening side owns the socket file. A client unlinking
        // it would orphan the live server.
        #[cfg(unix)]
        if previous_role == PeerRole::Server {
            let _ = fs_err::remove_file(&self.shared.socket_path);
        }
    }

    #[cfg(unix)]
    async fn negotiate(&self) -> Result<(), DesktopError> {
        let path = self.shared.socket_path.clone();

        if let Some(parent) = path.parent() {
            let _ = fs_err::create_dir_all(parent);
        }

        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    self.become_client(stream);
                    return Ok(());
                }
                Err(err) if is_stale_socket_error(&err) => {
                    log::debug!(
                        "Stale desktop socket at {} ({}); taking over",
                        path.display(),
                        err
                    );
                    let _ = fs_err::remove_file(&path);
                }
                Err(source) => {
                    return Err(DesktopError::Connect {
                        path,
                        source,
                    })
                }
            }
        }

        loop {
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    self.become_server(listener);
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    let _ = fs_err::remove_file(&path);
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(source) => {
                    return Err(DesktopError::Bind {
                        path,
                        source,
                    })
                }
            }
        }
    }

    #[cfg(unix)]
    fn become_server(&self, listener: UnixListener) {
        *self.shared.role.lock().unwrap() = PeerRole::Server;
        log::info!(
            "Desktop socket server listening at {}",
            self.shared.socket_path.display()
        );

        let shared = Arc::clone(&self.shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        attach_peer(&shared, stream);
                        (shared.on_change)();
                    }
                    Err(err) => {
                        log::warn!("Desktop socket accept failed: {}", err);
                        break;
                    }
                }
            }
        });

        self.shared.tasks.lock().unwrap().push(accept_task);
        (self.shared.on_change)();
    }

    #[cfg(unix)]
    fn become_client(&self, stream: UnixStream) {
        *self.shared.role.lock().unwrap() = PeerRole::Client;
        log::info!(
            "Connected to desktop socket at {} as client",
            self.shared.socket_path.display()
        );

        attach_peer(&self.shared, stream);
        (self.shared.on_change)();
    }

    #[cfg(windows)]
    async fn negotiate(&self) -> Result<(), DesktopError> {
        use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

        let path = self.shared.socket_path.clone();
        let pipe_name = path.to_string_lossy().into_owned();

        if let Ok(client) = ClientOptions::new().open(&pipe_name) {
            *self.shared.role.lock().unwrap() = PeerRole::Client;
            attach_peer(&self.shared, client);
            (self.shared.on_change)();
            return Ok(());
        }

        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .map_err(|source| DesktopError::Bind {
                path,
                source,
            })?;

        *self.shared.role.lock().unwrap() = PeerRole::Server;

        let shared = Arc::clone(&self.shared);
        let accept_task = tokio::spawn(async move {
            let mut pending = first;
            loop {
                if pending.connect().await.is_err() {
                    break;
                }
                let next = match ServerOptions::new().create(&pipe_name) {
                    Ok(next) => next,
                    Err(err) => {
                        log::warn!("Could not create next pipe instance: {}", err);
                        break;
                    }
                };
                let connected = std::mem::replace(&mut pending, next);
                attach_peer(&shared, connected);
                (shared.on_change)();
            }
        });

        self.shared.tasks.lock().unwrap().push(accept_task);
        (self.shared.on_change)();
        Ok(())
    }
}

/// Wires one connected stream into the peer set: a writer task draining the
/// outbound queue and a reader task splitting newline-delimited JSON.
fn attach_peer<S>(shared: &Arc<PeerShared>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer_id = {
        let mut next = shared.next_peer_id.lock().unwrap();
        *next += 1;
        *next
    };

    let (sender, mut receiver) = unbounded_channel::<String>();
    shared.peers.lock().unwrap().insert(peer_id, sender);

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = receiver.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let reader_shared = Arc::clone(shared);
    let reader_task = tokio::spawn(async move {
        // Partial lines accumulate here until their newline arrives.
        let mut buffer = String::new();
        let mut chunk = [0u8; 4096];

        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim().to_owned();
                        buffer.drain(..=newline);
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(message) => (reader_shared.on_message)(message),
                            Err(err) => {
                                log::warn!("Malformed desktop message dropped: {}", err);
                            }
                        }
                    }
                }
            }
        }

        if reader_shared.peers.lock().unwrap().remove(&peer_id).is_some() {
            (reader_shared.on_change)();
        }
    });

    let mut tasks = shared.tasks.lock().unwrap();
    tasks.push(writer_task);
    tasks.push(reader_task);
}

/// Errors that mean "the socket file is left over from a dead server".
#[cfg(unix)]
fn is_stale_socket_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::NotFound
    ) {
        return true;
    }

    // ENOTSOCK and EISDIR have no stable ErrorKind mapping. ENOTSOCK is 88
    // on Linux and 38 on the BSD family.
    const ENOTSOCK: i32 = if cfg!(target_os = "linux") { 88 } else { 38 };
    const EISDIR: i32 = 21;
    matches!(err.raw_os_error(), Some(code) if code == ENOTSOCK || code == EISDIR)
}

#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("Could not bind desktop socket at {}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect to desktop socket at {}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
