//! Retrieval of editor public keys from the remote registry.
//!
//! When an editor client announces `key_registered` with a key UUID, the
//! fetcher polls the registry until that key becomes available, then installs
//! it as the process-wide active key. At most one key is active at a time;
//! installing a new one replaces the previous record atomically without
//! cancelling verifies already holding a snapshot of the old one.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Deserialize;

/// The active editor key: SPKI DER bytes plus its registry expiry.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub uuid: String,
    pub public_key_der: Vec<u8>,
    /// Unix epoch milliseconds after which the key is no longer valid.
    pub expiration_time: u64,
}

type KeyListener = Box<dyn Fn(&KeyRecord) + Send + Sync>;

/// Single-slot store for the active key.
pub struct KeyManager {
    slot: Mutex<Option<Arc<KeyRecord>>>,
    listener: Mutex<Option<KeyListener>>,
}

impl KeyManager {
    pub fn new() -> Self {
        KeyManager {
            slot: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Installs `record`, replacing any previous key, and notifies the
    /// listener.
    pub fn set_current_key(&self, record: KeyRecord) {
        let record = Arc::new(record);
        *self.slot.lock().unwrap() = Some(Arc::clone(&record));
        log::info!("Registered editor public key {}", record.uuid);

        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(&record);
        }
    }

    /// Snapshot of the active key. Callers keep their reference across
    /// rotations.
    pub fn current(&self) -> Option<Arc<KeyRecord>> {
        self.slot.lock().unwrap().clone()
    }

    /// Clears the slot if it still holds `uuid`.
    pub fn clear_if(&self, uuid: &str) {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().is_some_and(|record| record.uuid == uuid) {
            log::info!("Editor public key {} expired", uuid);
            *slot = None;
        }
    }

    /// Registers the single install listener (the bus's `key_ready`
    /// broadcast).
    pub fn set_listener(&self, listener: impl Fn(&KeyRecord) + Send + Sync + 'static) {
        *self.listener.lock().unwrap() = Some(Box::new(listener));
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryKeyResponse {
    /// Base-64 SPKI DER.
    public_key: String,
    /// Unix epoch milliseconds.
    expiration_time: u64,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Fetches keys by UUID with per-UUID deduplication and capped exponential
/// backoff.
pub struct KeyFetcher {
    manager: Arc<KeyManager>,
    registry_url: String,
    client: reqwest::Client,
    in_flight: Mutex<HashSet<String>>,
}

impl KeyFetcher {
    pub fn new(manager: Arc<KeyManager>, registry_url: String) -> Self {
        KeyFetcher {
            manager,
            registry_url,
            client: reqwest::Client::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Starts an independent retry loop for `uuid` unless one is already
    /// running.
    pub fn start_fetching(self: &Arc<Self>, uuid: String) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(uuid.clone()) {
                log::debug!("Key fetch for {} already in flight", uuid);
                return;
            }
        }

        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            fetcher.fetch_loop(&uuid).await;
            fetcher.in_flight.lock().unwrap().remove(&uuid);
        });
    }

    async fn fetch_loop(self: &Arc<Self>, uuid: &str) {
        let url = format!("{}/{}", self.registry_url.trim_end_matches('/'), uuid);
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.fetch_once(&url).await {
                Ok(response) => {
                    let der = match data_encoding::BASE64.decode(response.public_key.as_bytes()) {
                        Ok(der) => der,
                        Err(err) => {
                            log::error!("Registry returned an undecodable key for {}: {}", uuid, err);
                            return;
                        }
                    };

                    let record = KeyRecord {
                        uuid: uuid.to_owned(),
                        public_key_der: der,
                        expiration_time: response.expiration_time,
                    };
                    let expiration_time = record.expiration_time;
                    self.manager.set_current_key(record);
                    self.schedule_expiry(uuid.to_owned(), expiration_time);
                    return;
                }
                Err(err) => {
                    log::debug!(
                        "Key fetch for {} failed ({}), retrying in {:?}",
                        uuid,
                        err,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<RegistryKeyResponse, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<RegistryKeyResponse>()
            .await
    }

    fn schedule_expiry(&self, uuid: String, expiration_time: u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let remaining = Duration::from_millis(expiration_time.saturating_sub(now));

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            manager.clear_if(&uuid);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_replaces_atomically_and_old_snapshots_survive() {
        let manager = KeyManager::new();
        manager.set_current_key(KeyRecord {
            uuid: "a".into(),
            public_key_der: vec![1],
            expiration_time: u64::MAX,
        });

        let snapshot = manager.current().unwrap();

        manager.set_current_key(KeyRecord {
            uuid: "b".into(),
            public_key_der: vec![2],
            expiration_time: u64::MAX,
        });

        // The rotation must not invalidate the reference an in-flight verify
        // already holds.
        assert_eq!(snapshot.uuid, "a");
        assert_eq!(manager.current().unwrap().uuid, "b");
    }

    #[test]
    fn clear_if_only_clears_matching_uuid() {
        let manager = KeyManager::new();
        manager.set_current_key(KeyRecord {
            uuid: "b".into(),
            public_key_der: vec![2],
            expiration_time: u64::MAX,
        });

        manager.clear_if("a");
        assert!(manager.current().is_some());
        manager.clear_if("b");
        assert!(manager.current().is_none());
    }

    #[test]
    fn listener_fires_on_install() {
        let manager = KeyManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handle = Arc::clone(&seen);
        manager.set_listener(move |record| {
            seen_handle.lock().unwrap().push(record.uuid.clone());
        });

        manager.set_current_key(KeyRecord {
            uuid: "k1".into(),
            public_key_der: vec![],
            expiration_time: u64::MAX,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["k1".to_owned()]);
    }
}
