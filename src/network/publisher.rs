//! Event Publisher
//!
//! Fans session events out to per-session channels and signs channel
//! subscriptions. Channel signatures follow the private/presence/encrypted
//! channel scheme used by hosted pub/sub services:
//!
//! ```text
//! auth          = <app_key>:hex(HMAC-SHA256(app_secret, "<socket_id>:<channel>[:<channel_data>]"))
//! shared_secret = base64(SHA-256(<channel> || master_key))
//! ```
//!
//! Delivery is best effort. Publishing never waits on subscribers.

use std::collections::BTreeMap;

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::game::events::{GameEvent, GameEventKind};
use crate::game::state::{GameSession, SessionId};
use crate::network::auth::TokenBinding;

type HmacSha256 = Hmac<Sha256>;

/// Default per-channel buffer before slow subscribers start lagging.
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

/// Kind of channel created for each session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Signed subscription, plaintext payloads.
    #[default]
    Private,
    /// Private plus member info in `channel_data`.
    Presence,
    /// Private plus a shared secret for end-to-end payload encryption.
    Encrypted,
}

impl ChannelKind {
    fn prefix(self) -> &'static str {
        match self {
            ChannelKind::Private => "private-game-",
            ChannelKind::Presence => "presence-game-",
            ChannelKind::Encrypted => "private-encrypted-game-",
        }
    }
}

/// Channel configuration.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Public application key, prefixed to every signature.
    pub app_key: String,
    /// Secret used to sign subscriptions.
    pub app_secret: String,
    /// Channel kind for new sessions.
    pub kind: ChannelKind,
    /// 32-byte master key for encrypted channels.
    pub encryption_master_key: Option<[u8; 32]>,
    /// Broadcast buffer per channel.
    pub buffer: usize,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("app_key", &self.app_key)
            .field("kind", &self.kind)
            .field("encrypted", &self.encryption_master_key.is_some())
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            app_key: "noughts".into(),
            app_secret: hex::encode(secret),
            kind: ChannelKind::Private,
            encryption_master_key: None,
            buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl ChannelConfig {
    /// Create config from environment variables.
    ///
    /// `CHANNEL_KIND=encrypted` without a valid
    /// `CHANNEL_ENCRYPTION_MASTER_KEY` falls back to private channels.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let encryption_master_key = std::env::var("CHANNEL_ENCRYPTION_MASTER_KEY")
            .ok()
            .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok());

        let mut kind = match std::env::var("CHANNEL_KIND").as_deref() {
            Ok("presence") => ChannelKind::Presence,
            Ok("encrypted") => ChannelKind::Encrypted,
            _ => ChannelKind::Private,
        };
        if kind == ChannelKind::Encrypted && encryption_master_key.is_none() {
            warn!(
                "CHANNEL_KIND=encrypted needs a 32-byte base64 \
                 CHANNEL_ENCRYPTION_MASTER_KEY, using private channels"
            );
            kind = ChannelKind::Private;
        }

        let app_secret = match std::env::var("CHANNEL_APP_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                warn!("CHANNEL_APP_SECRET not set, channel grants will not survive a restart");
                defaults.app_secret
            }
        };

        Self {
            app_key: std::env::var("CHANNEL_APP_KEY").unwrap_or(defaults.app_key),
            app_secret,
            kind,
            encryption_master_key,
            buffer: std::env::var("CHANNEL_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.buffer),
        }
    }
}

/// A message delivered on a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Channel the event was published on.
    pub channel: String,
    /// Event kind.
    pub event: GameEventKind,
    /// Full session snapshot.
    pub data: GameSession,
}

/// Subscription grant returned to an authorized socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionGrant {
    /// `<app_key>:<signature>`.
    pub auth: String,
    /// Member info (presence channels only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
    /// Payload key (encrypted channels only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    /// Channel the grant is valid for.
    #[serde(rename = "channelId")]
    pub channel_id: String,
}

/// Subscription errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Socket id is not `<digits>.<digits>`.
    #[error("invalid socket id")]
    InvalidSocketId,
    /// Token is bound to another session.
    #[error("token not valid for this session")]
    WrongSession,
    /// Token player is not seated in the session.
    #[error("player not in session")]
    NotSeated,
    /// Session already finished.
    #[error("session finished")]
    SessionFinished,
    /// Grant could not be encoded or signed.
    #[error("grant encoding failed: {0}")]
    Encoding(String),
}

/// Presence member info.
#[derive(Serialize)]
struct PresenceData<'a> {
    user_id: String,
    user_info: PresenceInfo<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceInfo<'a> {
    email: &'a str,
    input_type: crate::game::state::InputType,
}

/// Publishes session events and authorizes channel subscriptions.
pub struct EventPublisher {
    /// Channel configuration.
    config: ChannelConfig,
    /// Live channels by name.
    channels: RwLock<BTreeMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl EventPublisher {
    /// Create a publisher.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(BTreeMap::new()),
        }
    }

    /// Channel name for a session.
    pub fn channel_id(&self, session_id: SessionId) -> String {
        format!("{}{}", self.config.kind.prefix(), session_id)
    }

    /// Fan an event out to the session's channel.
    ///
    /// Returns the number of receivers it reached.
    pub async fn publish(&self, session_id: SessionId, event: &GameEvent) -> usize {
        let channel = self.channel_id(session_id);
        let channels = self.channels.read().await;
        let Some(sender) = channels.get(&channel) else {
            debug!(%channel, event = event.kind.as_str(), "no subscribers");
            return 0;
        };

        let message = ChannelMessage {
            channel: channel.clone(),
            event: event.kind,
            data: event.session.clone(),
        };
        match sender.send(message) {
            Ok(reached) => {
                debug!(%channel, event = event.kind.as_str(), reached, "event published");
                reached
            }
            Err(_) => 0,
        }
    }

    /// Publish a batch in order.
    pub async fn publish_all(&self, session_id: SessionId, events: &[GameEvent]) {
        for event in events {
            self.publish(session_id, event).await;
        }
    }

    /// Attach a receiver to a channel, creating it on first use.
    pub async fn open_channel(&self, channel: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.config.buffer).0)
            .subscribe()
    }

    /// Drop a session's channel. Existing receivers see the channel close.
    pub async fn close_session_channel(&self, session_id: SessionId) {
        let channel = self.channel_id(session_id);
        if self.channels.write().await.remove(&channel).is_some() {
            debug!(%channel, "channel closed");
        }
    }

    /// Get open channel count.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Sign a subscription for `socket_id` after checking the token binding
    /// against the session.
    pub fn authorize_subscription(
        &self,
        socket_id: &str,
        session: &GameSession,
        binding: &TokenBinding,
    ) -> Result<SubscriptionGrant, SubscriptionError> {
        if !is_valid_socket_id(socket_id) {
            return Err(SubscriptionError::InvalidSocketId);
        }
        if binding.session_id != session.id {
            return Err(SubscriptionError::WrongSession);
        }
        let player = session
            .player(&binding.player_id)
            .ok_or(SubscriptionError::NotSeated)?;
        if session.is_finished() {
            return Err(SubscriptionError::SessionFinished);
        }

        let channel_id = self.channel_id(session.id);
        let channel_data = match self.config.kind {
            ChannelKind::Presence => {
                let member = PresenceData {
                    user_id: player.id.to_string(),
                    user_info: PresenceInfo {
                        email: &player.email,
                        input_type: player.input_type,
                    },
                };
                let encoded = serde_json::to_string(&member)
                    .map_err(|e| SubscriptionError::Encoding(e.to_string()))?;
                Some(encoded)
            }
            ChannelKind::Private | ChannelKind::Encrypted => None,
        };
        let shared_secret = match (self.config.kind, self.config.encryption_master_key) {
            (ChannelKind::Encrypted, Some(master)) => Some(shared_secret(&channel_id, &master)),
            _ => None,
        };

        let signature = self.sign(socket_id, &channel_id, channel_data.as_deref())?;
        Ok(SubscriptionGrant {
            auth: format!("{}:{}", self.config.app_key, signature),
            channel_data,
            shared_secret,
            channel_id,
        })
    }

    fn sign(
        &self,
        socket_id: &str,
        channel: &str,
        channel_data: Option<&str>,
    ) -> Result<String, SubscriptionError> {
        let mut payload = format!("{}:{}", socket_id, channel);
        if let Some(data) = channel_data {
            payload.push(':');
            payload.push_str(data);
        }
        let mut mac = HmacSha256::new_from_slice(self.config.app_secret.as_bytes())
            .map_err(|e| SubscriptionError::Encoding(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

/// Derive the per-channel payload key for encrypted channels.
pub fn shared_secret(channel: &str, master_key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_bytes());
    hasher.update(master_key);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// `<digits>.<digits>`.
pub fn is_valid_socket_id(socket_id: &str) -> bool {
    let Some((left, right)) = socket_id.split_once('.') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(left) && digits(right)
}
