use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::runtime::Runtime;

use crate::{
    config::{Config, ConfigOverlay},
    fs_gateway::FsGateway,
    host_agent::HostAgent,
    keys::LocalKeyStore,
};

use super::resolve_path;

/// Run the host agent: connect out to a bus and serve host-side requests
/// (git status, clipboard, terminals) against this machine's checkout.
#[derive(Debug, Parser)]
pub struct AgentCommand {
    /// Path to the host-side checkout of the project. Defaults to the
    /// current directory.
    #[clap(default_value = ".")]
    pub project: PathBuf,

    /// Bus URL to dial. Defaults to the project's configured `ws` address.
    #[clap(long)]
    pub bus_url: Option<String>,
}

impl AgentCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let project_dir = resolve_path(&self.project);
        let config = Config::load(&project_dir, ConfigOverlay::default())?;

        let bus_url = self.bus_url.unwrap_or_else(|| config.ws_url());
        let workspace = config.working_directory.clone();

        let key_store = Arc::new(LocalKeyStore::new(&workspace));
        let gateway = Arc::new(FsGateway::new(crate::config::shared(config)));

        let agent = HostAgent::new(bus_url, workspace, key_store, gateway);

        let rt = Runtime::new()?;
        rt.block_on(async move {
            tokio::select! {
                result = agent.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted; closing tunnel");
                    agent.stop();
                }
            }
            Ok(())
        })
    }
}
