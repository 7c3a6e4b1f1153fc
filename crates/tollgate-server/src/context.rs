//! Per-worker application context.
//!
//! Everything a request handler or background task touches hangs off this
//! one object (session cache, stores, paywall index, broadcast cursor), so
//! tests build as many independent contexts as they need and nothing is
//! ambient. Several contexts may serve one site, each with its own worker
//! id; they share only the notification bus they were constructed with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::bip32::Xpub;
use tollgate_core::paywall::PaywallIndex;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::derive::KeyDeriver;
use crate::error::{Error, Result};
use crate::notify::NotificationHub;
use crate::paths::SitePaths;
use crate::store::{CounterStore, SessionStore, SiteStore};

/// Config-store key holding the site's master extended public key.
pub const MASTER_KEY_CONFIG: &str = "$.config.masterPubKey";

/// File-index path of the paywall rules document.
pub const PAYWALLS_URL_PATH: &str = "/paywalls.json";

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

struct SessionEntry {
    store: Arc<SessionStore>,
    last_access: i64,
}

pub struct AppContext {
    pub config: Config,
    pub paths: SitePaths,
    pub site: SiteStore,
    pub counters: CounterStore,
    pub deriver: KeyDeriver,
    pub broadcaster: Broadcaster,
    pub hub: Arc<NotificationHub>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    paywalls: RwLock<Arc<PaywallIndex>>,
    master_key: RwLock<Option<Xpub>>,
}

impl AppContext {
    pub fn open(config: Config, hub: Arc<NotificationHub>) -> Result<Arc<Self>> {
        let paths = SitePaths::new(&config.site_dir);
        paths.ensure_dirs()?;

        let site = SiteStore::open(&paths.site_db())?;
        let counters = CounterStore::open(&paths.counters_db(config.worker_id))?;
        let broadcaster = Broadcaster::new(config.relays.clone());

        let ctx = Arc::new(AppContext {
            config,
            paths,
            site,
            counters,
            deriver: KeyDeriver::new(),
            broadcaster,
            hub,
            sessions: Mutex::new(HashMap::new()),
            paywalls: RwLock::new(Arc::new(PaywallIndex::default())),
            master_key: RwLock::new(None),
        });

        // The site may not be activated yet; start gating nothing and let
        // the reload task pick the documents up once they are published.
        if let Err(err) = ctx.reload_paywalls() {
            tracing::warn!("paywall rules unavailable at startup: {err}");
        }
        if let Err(err) = ctx.reload_master_key() {
            tracing::warn!("master public key unavailable at startup: {err}");
        }

        Ok(ctx)
    }

    /// Fetch the session's ledger, opening (and with `create`, creating) it
    /// as needed. Every fetch stamps the session's check-in.
    pub fn session(&self, session_id: &str, create: bool) -> Result<Arc<SessionStore>> {
        let now = now_ms();

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_access = now;
            let store = Arc::clone(&entry.store);
            drop(sessions);
            store.set_check_in(now)?;
            return Ok(store);
        }

        let path = self.paths.session_db(session_id);
        if !create && !path.exists() {
            return Err(Error::UnknownSession);
        }

        let store = Arc::new(SessionStore::open(&path, now)?);
        store.set_check_in(now)?;
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                store: Arc::clone(&store),
                last_access: now,
            },
        );
        Ok(store)
    }

    /// Drop cached session handles idle for at least `idle_ms`. In-flight
    /// requests keep their own `Arc`; the backing file closes with the last
    /// reference and any later request simply reopens it.
    pub fn evict_idle_sessions(&self, idle_ms: i64) -> usize {
        let cutoff = now_ms() - idle_ms;
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_access >= cutoff);
        before - sessions.len()
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Current paywall index. Cheap: clones the `Arc`, never the index.
    pub fn paywalls(&self) -> Arc<PaywallIndex> {
        Arc::clone(&self.paywalls.read().unwrap())
    }

    /// Rebuild the paywall index from the published rules document and swap
    /// it in whole. In-flight lookups keep the index they started with.
    pub fn reload_paywalls(&self) -> Result<usize> {
        let index = match self.site.file_row(PAYWALLS_URL_PATH)? {
            None => PaywallIndex::default(),
            Some(row) => {
                let text = std::fs::read_to_string(self.paths.file(&row.storage_path))?;
                PaywallIndex::from_json(&text)?
            }
        };

        let rules = index.len();
        *self.paywalls.write().unwrap() = Arc::new(index);
        Ok(rules)
    }

    pub fn master_key(&self) -> Option<Xpub> {
        *self.master_key.read().unwrap()
    }

    /// Re-read the master public key from the site's config store.
    pub fn reload_master_key(&self) -> Result<bool> {
        let key = match self.site.config_get(MASTER_KEY_CONFIG)? {
            None => None,
            Some(text) => Some(text.trim().parse::<Xpub>().map_err(Error::DeriveError)?),
        };

        let found = key.is_some();
        *self.master_key.write().unwrap() = key;
        Ok(found)
    }
}
