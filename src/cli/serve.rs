use std::path::PathBuf;

use clap::Parser;
use tokio::runtime::Runtime;

use crate::{
    config::{Config, ConfigOverlay},
    session::SidecarSession,
};

use super::resolve_path;

/// Expose a web project to editor and desktop clients.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Path to the project to serve. Defaults to the current directory.
    #[clap(default_value = ".")]
    pub project: PathBuf,

    /// The port the message bus WebSocket listens on.
    #[clap(long)]
    pub ws_port: Option<u16>,

    /// The port the reverse proxy listens on.
    #[clap(long)]
    pub proxy_port: Option<u16>,

    /// The port the application dev server is already listening on.
    #[clap(long)]
    pub server_port: Option<u16>,

    /// Disable request signature verification. Development only.
    #[clap(long)]
    pub insecure: bool,

    /// Run the bus without the reverse proxy.
    #[clap(long)]
    pub no_proxy: bool,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let project_dir = resolve_path(&self.project);

        let overrides = ConfigOverlay {
            ws_port: self.ws_port,
            proxy_port: self.proxy_port,
            server_port: self.server_port,
            insecure: self.insecure.then_some(true),
            no_proxy: self.no_proxy.then_some(true),
            ..Default::default()
        };
        let config = Config::load(&project_dir, overrides)?;

        if config.insecure {
            log::warn!("Signature verification is DISABLED (--insecure)");
        }

        let rt = Runtime::new()?;
        rt.block_on(async move {
            let session = SidecarSession::start(config).await?;

            tokio::select! {
                result = session.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted; shutting down");
                }
            }

            session.stop().await;
            Ok(())
        })
    }
}
