//! Contains all of the state for a running sidecar: the config store, key
//! machinery, filesystem gateway, watchers, desktop peer, language facade,
//! and the bus that ties them together.
//!
//! Everything is wired by explicit construction. The bus never sees its
//! collaborators' concrete types in reverse: components that need to push
//! events get a [`Broadcaster`] closure over the connection registry, which
//! is what breaks the bus ↔ watcher / facade / desktop cycles.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::{json, Value};

use crate::{
    bus::{
        interface::EventFrame, Broadcaster, BusState, ConnectionRegistry, MessageBus,
    },
    config::{self, Config, SharedConfig},
    desktop::{default_socket_path, DesktopPeer},
    fs_gateway::{ChangeWatcher, FsGateway},
    keys::{KeyFetcher, KeyManager, LocalKeyStore},
    lang::LangFacade,
    proxy::ReverseProxy,
};

pub struct SidecarSession {
    config: SharedConfig,
    bus: MessageBus,
    proxy: Option<ReverseProxy>,
    desktop: Arc<DesktopPeer>,
    lang: Arc<LangFacade>,

    /// Held for its side effects; dropping it stops the debounce thread.
    watcher: Mutex<Option<ChangeWatcher>>,
}

impl SidecarSession {
    /// Builds and wires every component. Failures here are fatal startup
    /// errors (exit code 1); after this point only teardown can fail.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let working_directory = config.working_directory.clone();
        let config = config::shared(config);

        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = {
            let registry = Arc::clone(&registry);
            Broadcaster::new(move |event_name, payload| registry.broadcast(event_name, payload))
        };

        let key_store = Arc::new(LocalKeyStore::new(&working_directory));
        key_store
            .regenerate_key_pair(false)
            .context("Could not prepare the project keypair")?;

        let key_manager = Arc::new(KeyManager::new());
        {
            let broadcaster = broadcaster.clone();
            key_manager.set_listener(move |record| {
                broadcaster.broadcast("key_ready", json!({ "uuid": record.uuid.clone() }));
            });
        }

        let key_fetcher = {
            let registry_url = config.read().unwrap().key_registry_url.clone();
            Arc::new(KeyFetcher::new(Arc::clone(&key_manager), registry_url))
        };

        let gateway = Arc::new(FsGateway::new(Arc::clone(&config)));

        let desktop = {
            let on_change = {
                let broadcaster = broadcaster.clone();
                Box::new(move || {
                    broadcaster.broadcast("updated_unix_client_info", json!({}));
                })
            };
            // Events pushed by the desktop app fan out to editor clients
            // unchanged.
            let on_message = {
                let broadcaster = broadcaster.clone();
                Box::new(move |message: Value| {
                    match serde_json::from_value::<EventFrame>(message) {
                        Ok(frame) => broadcaster.broadcast(&frame.event_name, frame.payload),
                        Err(err) => log::debug!("Unroutable desktop message dropped: {}", err),
                    }
                })
            };

            Arc::new(
                DesktopPeer::start(default_socket_path(), on_change, on_message)
                    .await
                    .context("Could not create the desktop socket")?,
            )
        };

        let lang = {
            let worker_command = config.read().unwrap().lsp_worker_command.clone();
            match LangFacade::start(
                worker_command.clone(),
                working_directory.clone(),
                broadcaster.clone(),
            )
            .await
            {
                Ok(facade) => Arc::new(facade),
                Err(err) => {
                    log::warn!(
                        "Language worker '{}' unavailable ({}); continuing without language intelligence",
                        worker_command,
                        err
                    );
                    Arc::new(LangFacade::disabled(broadcaster.clone()))
                }
            }
        };

        let watcher = {
            let broadcaster = broadcaster.clone();
            let roots = {
                let config = config.read().unwrap();
                let mut roots = vec![config.working_directory.clone()];
                roots.extend(config.additional_directories.iter().cloned());
                roots
            };

            ChangeWatcher::start(
                roots,
                Box::new(move |batch| {
                    broadcaster.broadcast(
                        "updated_project_info",
                        json!({ "file_changes": batch }),
                    );
                }),
            )
            .context("Could not start the filesystem watcher")?
        };

        let state = Arc::new(BusState::new(
            Arc::clone(&config),
            registry,
            gateway,
            key_store,
            key_manager,
            key_fetcher,
            Arc::clone(&desktop),
            Arc::clone(&lang),
        ));
        let bus = MessageBus::new(state);

        let proxy = if config.read().unwrap().no_proxy {
            None
        } else {
            Some(ReverseProxy::new(Arc::clone(&config))?)
        };

        Ok(SidecarSession {
            config,
            bus,
            proxy,
            desktop,
            lang,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Serves the bus (and the proxy, unless disabled) until [`stop`] is
    /// called. Bind failures surface here and are fatal.
    ///
    /// [`stop`]: SidecarSession::stop
    pub async fn run(&self) -> anyhow::Result<()> {
        match &self.proxy {
            Some(proxy) => {
                tokio::try_join!(
                    async { self.bus.serve().await.map_err(anyhow::Error::from) },
                    async { proxy.serve().await.map_err(anyhow::Error::from) },
                )?;
            }
            None => self.bus.serve().await?,
        }
        Ok(())
    }

    /// Ordered teardown: the language worker first (it gets a grace period),
    /// then the bus and proxy, then the watcher and desktop peer.
    pub async fn stop(&self) {
        self.lang.shutdown().await;
        self.bus.stop();
        if let Some(proxy) = &self.proxy {
            proxy.stop();
        }

        // Dropping the watcher joins its debounce thread.
        self.watcher.lock().unwrap().take();

        self.desktop.close().await;
        log::info!("Sidecar stopped");
    }

    pub fn config(&self) -> SharedConfig {
        Arc::clone(&self.config)
    }
}
