//! Single-use confirmation tokens for pending data-modifying SQL.
//!
//! A token maps to the exact SQL text that was proposed. Redeeming it removes
//! the entry whether or not it is still valid, so each token can be honoured
//! at most once. Expired entries are also dropped by a periodic sweep.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

/// Default lifetime of a confirmation token.
pub const DEFAULT_TOKEN_EXPIRATION: Duration = Duration::from_millis(300_000);

/// Default period of the expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(60_000);

// `tokio::time::interval` rejects a zero period.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

const TOKEN_BYTES: usize = 32;
const FINGERPRINT_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStoreConfig {
    pub expiration: Duration,
    pub cleanup_interval: Duration,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_TOKEN_EXPIRATION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    query: String,
    created_at: Instant,
    expires_at: Instant,
}

impl PendingConfirmation {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// A freshly minted token together with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// In-memory token map shared by every request of the process.
#[derive(Debug, Default)]
pub struct ConfirmationTokenStore {
    config: TokenStoreConfig,
    entries: Mutex<HashMap<String, PendingConfirmation>>,
}

impl ConfirmationTokenStore {
    pub fn new(config: TokenStoreConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TokenStoreConfig {
        &self.config
    }

    /// Records `query` under `token`, replacing any previous entry.
    pub fn store(&self, token: &str, query: impl Into<String>) {
        let now = Instant::now();
        let entry = PendingConfirmation {
            query: query.into(),
            created_at: now,
            expires_at: now + self.config.expiration,
        };
        self.entries.lock().insert(token.to_owned(), entry);
        debug!(token_fingerprint = %token_fingerprint(token), "confirmation token stored");
    }

    /// Generates a token and stores `query` under it.
    pub fn issue(&self, query: impl Into<String>) -> IssuedToken {
        let token = generate_token();
        self.store(&token, query);
        IssuedToken {
            token,
            expires_in: self.config.expiration,
        }
    }

    /// Removes the entry for `token` and returns its query if it had not
    /// expired yet. Unknown and expired tokens are indistinguishable.
    pub fn get_and_invalidate(&self, token: &str) -> Option<String> {
        let entry = self.entries.lock().remove(token)?;
        if entry.is_expired(Instant::now()) {
            debug!(
                token_fingerprint = %token_fingerprint(token),
                "confirmation token presented after expiry"
            );
            return None;
        }
        debug!(
            token_fingerprint = %token_fingerprint(token),
            age_ms = entry.created_at.elapsed().as_millis() as u64,
            "confirmation token redeemed"
        );
        Some(entry.query)
    }

    /// Drops every entry whose expiry has passed and returns how many went.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "expired confirmation tokens swept");
        }
        removed
    }

    /// Number of live tokens, after sweeping expired ones.
    pub fn active_token_count(&self) -> usize {
        self.cleanup_expired();
        self.entries.lock().len()
    }

    /// Starts the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and ends on its own once the
    /// store is dropped; [`SweeperHandle::shutdown`] stops it earlier.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let period = self.config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        let store = Arc::downgrade(self);
        let handle = tokio::spawn(run_sweeper(store, period));
        info!(interval_ms = period.as_millis() as u64, "confirmation token sweeper started");
        SweeperHandle {
            handle: Some(handle),
        }
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str) {
        if let Some(entry) = self.entries.lock().get_mut(token) {
            entry.expires_at = Instant::now() - Duration::from_millis(1);
        }
    }
}

async fn run_sweeper(store: Weak<ConfirmationTokenStore>, period: Duration) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            debug!("confirmation token store dropped; sweeper exiting");
            return;
        };
        store.cleanup_expired();
    }
}

/// Owns the sweep task; dropping it cancels the task.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancels the sweep and waits for the task to wind down.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
            info!("confirmation token sweeper stopped");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// 32 bytes from the thread-local CSPRNG, hex encoded (64 characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Short SHA-256 prefix used to refer to a token in logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}
