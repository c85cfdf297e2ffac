pub mod cli;

mod bus;
mod config;
mod desktop;
mod fs_gateway;
mod host_agent;
mod keys;
mod lang;
pub mod logging;
mod path_translate;
mod proxy;
mod pty;
mod session;

pub use bus::interface as wire;
pub use bus::{Broadcaster, MessageBus};
pub use config::{
    quick_read_enable_logging, Config, ConfigError, ConfigOverlay, HttpProtocol, WsProtocol,
};
pub use desktop::{default_socket_path, DesktopPeer, PeerRole};
pub use fs_gateway::{ChangeWatcher, FsGateway};
pub use host_agent::HostAgent;
pub use keys::{
    canonical_request_bytes, sign_request, KeyFetcher, KeyManager, KeyRecord, LocalKeyStore,
    SignatureVerifier,
};
pub use lang::LangFacade;
pub use path_translate::{translate_dev_to_host, translate_host_to_dev, translate_value};
pub use proxy::ReverseProxy;
pub use pty::{PtyEvent, PtyManager};
pub use session::SidecarSession;
