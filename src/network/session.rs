//! Session Registry
//!
//! Process-wide store of live sessions. Each session sits behind its own
//! lock, so operations on different sessions never contend; all reads and
//! mutations of one session are serialized through that lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::game::state::{GameMode, GameSession, GameStatus, Player, SessionId};

/// Default grace period before a finished session may be evicted.
pub const DEFAULT_FINISHED_GRACE: Duration = Duration::from_secs(5 * 60);

/// Default idle time before an abandoned in-progress session may be evicted.
/// Matches the token lifetime, after which nobody can move in it anyway.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a finished session stays reachable.
    pub finished_grace: Duration,
    /// How long an in-progress session may go without a move.
    pub idle_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            finished_grace: DEFAULT_FINISHED_GRACE,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

impl RegistryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            finished_grace: env_secs("SESSION_FINISHED_GRACE_SECS")
                .unwrap_or(DEFAULT_FINISHED_GRACE),
            idle_ttl: env_secs("SESSION_IDLE_TTL_SECS").unwrap_or(DEFAULT_IDLE_TTL),
        }
    }
}

/// A registry slot: the session plus bookkeeping the wire never sees.
#[derive(Debug)]
pub struct SessionEntry {
    /// Authoritative session state.
    pub session: GameSession,
    /// When the session was first observed finished.
    finished_at: Option<Instant>,
    /// Last successful mutation.
    last_activity: Instant,
}

impl SessionEntry {
    fn new(session: GameSession) -> Self {
        Self {
            session,
            finished_at: None,
            last_activity: Instant::now(),
        }
    }

    /// Bookkeeping after a successful mutation.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.mark_if_finished();
    }

    fn mark_if_finished(&mut self) {
        if self.session.status == GameStatus::Finished && self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    fn evictable(&self, now: Instant, config: &RegistryConfig) -> bool {
        if let Some(at) = self.finished_at {
            return now.saturating_duration_since(at) >= config.finished_grace;
        }
        // Waiting sessions hold an open seat and are never evicted.
        self.session.status == GameStatus::InProgress
            && now.saturating_duration_since(self.last_activity) >= config.idle_ttl
    }
}

/// Shared handle to one session.
pub type SharedSession = Arc<RwLock<SessionEntry>>;

/// Open PLAYER_VS_PLAYER seats, guarded as one unit with the matchmaking scan.
pub type WaitingList = Vec<SessionId>;

/// Manages all live sessions.
pub struct SessionRegistry {
    /// Live sessions.
    sessions: RwLock<BTreeMap<SessionId, SharedSession>>,
    /// Sessions waiting for a second player, oldest first.
    waiting: Mutex<WaitingList>,
    /// Next sequential session number.
    next_number: AtomicU64,
    /// Registry configuration.
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            waiting: Mutex::new(Vec::new()),
            next_number: AtomicU64::new(1),
            config,
        }
    }

    /// Create and store a session seated with `first`.
    pub async fn create(&self, mode: GameMode, first: Player) -> SharedSession {
        let id = SessionId::random();
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let session = GameSession::open(id, number, mode, first);

        let shared = Arc::new(RwLock::new(SessionEntry::new(session)));
        self.sessions.write().await.insert(id, shared.clone());
        debug!(session_id = %id, number, ?mode, "session created");
        shared
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Lock the waiting list. Hold the guard across scan and seat assignment.
    pub async fn waiting(&self) -> MutexGuard<'_, WaitingList> {
        self.waiting.lock().await
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Get count of sessions waiting for a player.
    pub async fn waiting_count(&self) -> usize {
        self.waiting.lock().await.len()
    }

    /// Remove finished sessions whose grace period has elapsed, and
    /// in-progress sessions idle past the idle TTL.
    ///
    /// Returns the evicted ids.
    pub async fn evict_expired(&self, now: Instant) -> Vec<SessionId> {
        let candidates: Vec<(SessionId, SharedSession)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        let mut expired = Vec::new();
        for (id, session) in candidates {
            let mut entry = session.write().await;
            entry.mark_if_finished();
            if entry.evictable(now, &self.config) {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &expired {
                sessions.remove(id);
            }
            info!(count = expired.len(), "evicted expired sessions");
        }

        expired
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
