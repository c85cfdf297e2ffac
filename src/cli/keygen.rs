use std::path::PathBuf;

use clap::Parser;

use crate::keys::LocalKeyStore;

use super::resolve_path;

/// Generate the project's ECDSA keypair under `.jsxtool/host-keys`.
#[derive(Debug, Parser)]
pub struct KeygenCommand {
    /// Path to the project. Defaults to the current directory.
    #[clap(default_value = ".")]
    pub project: PathBuf,

    /// Overwrite an existing keypair.
    #[clap(long)]
    pub force: bool,
}

impl KeygenCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let project_dir = resolve_path(&self.project);
        let store = LocalKeyStore::new(&project_dir);

        if store.regenerate_key_pair(self.force)? {
            log::info!("Keypair written under {}", project_dir.join(".jsxtool/host-keys").display());
        } else {
            log::info!("Keypair already exists; rerun with --force to replace it");
        }

        Ok(())
    }
}
