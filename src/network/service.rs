//! Game Service
//!
//! The request/response surface: `join`, `make_move` and `subscribe`.
//! Composes the matchmaker, registry, token issuer, arbiter and publisher.
//! Transport bindings call into this and nothing else.
//!
//! Every mutation of a session, including the computer's reply and the
//! resulting event publication, runs under that session's write lock.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::game::agent::{AgentStrategy, ComputerAgent};
use crate::game::arbiter::{play_turn, MoveError};
use crate::game::state::{GameMode, GameSession, InputType, SessionId};
use crate::network::auth::{bearer_token, AuthConfig, TokenBinding, TokenIssuer};
use crate::network::matchmaker::{JoinError, Matchmaker};
use crate::network::protocol::{ErrorCode, GameResponse, SubscriptionResponse};
use crate::network::publisher::{ChannelConfig, ChannelMessage, EventPublisher, SubscriptionError};
use crate::network::session::{RegistryConfig, SessionRegistry};

/// Service configuration.
#[derive(Clone, Default)]
pub struct ServiceConfig {
    /// Token settings.
    pub auth: AuthConfig,
    /// Registry settings.
    pub registry: RegistryConfig,
    /// Channel settings.
    pub channels: ChannelConfig,
    /// Computer move strategy.
    pub strategy: AgentStrategy,
}

impl ServiceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            auth: AuthConfig::from_env(),
            registry: RegistryConfig::from_env(),
            channels: ChannelConfig::from_env(),
            strategy: AgentStrategy::from_env(),
        }
    }
}

/// Broad error classes, for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, rejected before any mutation. Retry with corrected input.
    Validation,
    /// Logical precondition failed. Never retried automatically.
    StateConflict,
    /// Credential or session mismatch.
    Authorization,
    /// Session missing or evicted.
    NotFound,
    /// Invariant violation on the server.
    Internal,
}

/// Service errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Email failed validation.
    #[error("invalid email: {0}")]
    InvalidEmail(String),
    /// Move choice missing, off the board or occupied.
    #[error("invalid choice: {0}")]
    InvalidChoice(String),
    /// Caller is not the turn holder.
    #[error("not your turn")]
    NotYourTurn,
    /// Session already finished.
    #[error("game already finished")]
    GameFinished,
    /// Session already has two players.
    #[error("session capacity exceeded")]
    SessionCapacityExceeded,
    /// Session does not exist.
    #[error("session not found")]
    SessionNotFound,
    /// Token missing, invalid or not bound to the session.
    #[error("unauthorized")]
    Unauthorized,
    /// Corrupted session state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::InvalidEmail(_) => ErrorCode::InvalidEmail,
            ServiceError::InvalidChoice(_) => ErrorCode::InvalidChoice,
            ServiceError::NotYourTurn => ErrorCode::NotYourTurn,
            ServiceError::GameFinished => ErrorCode::GameFinished,
            ServiceError::SessionCapacityExceeded => ErrorCode::SessionCapacityExceeded,
            ServiceError::SessionNotFound => ErrorCode::SessionNotFound,
            ServiceError::Unauthorized => ErrorCode::Unauthorized,
            ServiceError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Error class.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::InvalidEmail(_) | ServiceError::InvalidChoice(_) => {
                ErrorCategory::Validation
            }
            ServiceError::NotYourTurn
            | ServiceError::GameFinished
            | ServiceError::SessionCapacityExceeded => ErrorCategory::StateConflict,
            ServiceError::Unauthorized => ErrorCategory::Authorization,
            ServiceError::SessionNotFound => ErrorCategory::NotFound,
            ServiceError::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<MoveError> for ServiceError {
    fn from(err: MoveError) -> Self {
        match err {
            MoveError::NotYourTurn => ServiceError::NotYourTurn,
            MoveError::GameFinished => ServiceError::GameFinished,
            MoveError::InvalidChoice(reason) => ServiceError::InvalidChoice(reason),
            MoveError::CorruptBoard(reason) => {
                error!(%reason, "session state corrupted");
                ServiceError::Internal(reason)
            }
        }
    }
}

impl From<JoinError> for ServiceError {
    fn from(err: JoinError) -> Self {
        match err {
            JoinError::InvalidEmail(email) => ServiceError::InvalidEmail(email),
            JoinError::SessionCapacityExceeded => ServiceError::SessionCapacityExceeded,
            JoinError::Move(e) => e.into(),
        }
    }
}

impl From<SubscriptionError> for ServiceError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Encoding(reason) => ServiceError::Internal(reason),
            other => {
                warn!(reason = %other, "subscription refused");
                ServiceError::Unauthorized
            }
        }
    }
}

/// The game session service.
pub struct GameService {
    registry: Arc<SessionRegistry>,
    tokens: TokenIssuer,
    publisher: Arc<EventPublisher>,
    agent: Arc<dyn ComputerAgent>,
    matchmaker: Matchmaker,
}

impl GameService {
    /// Build a service with fresh, empty state.
    pub fn new(config: ServiceConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry));
        let publisher = Arc::new(EventPublisher::new(config.channels));
        let agent = config.strategy.build();
        let matchmaker = Matchmaker::new(registry.clone(), publisher.clone(), agent.clone());

        info!(agent = agent.name(), "game service ready");
        Self {
            registry,
            tokens: TokenIssuer::new(&config.auth),
            publisher,
            agent,
            matchmaker,
        }
    }

    /// Seat a player and mint their token.
    #[instrument(skip(self, email), fields(mode = ?mode))]
    pub async fn join(
        &self,
        email: &str,
        mode: GameMode,
        input_type: InputType,
    ) -> Result<GameResponse, ServiceError> {
        let outcome = self.matchmaker.join(email, mode, input_type).await?;
        let token = self
            .tokens
            .issue(outcome.session.id, outcome.player_id)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        info!(
            session_id = %outcome.session.id,
            player_id = %outcome.player_id.short(),
            status = ?outcome.session.status,
            "player joined"
        );
        Ok(GameResponse {
            game: outcome.session,
            token,
        })
    }

    /// Apply the token holder's move and return the resulting snapshot.
    #[instrument(skip(self, token), fields(session_id = %session_id))]
    pub async fn make_move(
        &self,
        choice: Option<i64>,
        session_id: SessionId,
        token: &str,
    ) -> Result<GameSession, ServiceError> {
        let binding = self.authenticate(token)?;
        if binding.session_id != session_id {
            return Err(ServiceError::Unauthorized);
        }

        let shared = self
            .registry
            .get(&session_id)
            .await
            .ok_or(ServiceError::SessionNotFound)?;
        let mut entry = shared.write().await;

        if entry.session.player(&binding.player_id).is_none() {
            return Err(ServiceError::Unauthorized);
        }

        let events = play_turn(&mut entry.session, binding.player_id, choice, self.agent.as_ref())?;
        entry.record_activity();
        self.publisher.publish_all(session_id, &events).await;

        info!(
            player_id = %binding.player_id.short(),
            moves = entry.session.moves.len(),
            status = ?entry.session.status,
            "move applied"
        );
        Ok(entry.session.clone())
    }

    /// Authorize `socket_id` on the session channel.
    ///
    /// `session_id` defaults to the session the token is bound to.
    #[instrument(skip(self, token))]
    pub async fn subscribe(
        &self,
        socket_id: &str,
        session_id: Option<SessionId>,
        token: &str,
    ) -> Result<SubscriptionResponse, ServiceError> {
        let binding = self.authenticate(token)?;
        let session_id = session_id.unwrap_or(binding.session_id);

        let shared = self
            .registry
            .get(&session_id)
            .await
            .ok_or(ServiceError::SessionNotFound)?;
        let entry = shared.read().await;

        let grant = self
            .publisher
            .authorize_subscription(socket_id, &entry.session, &binding)?;
        info!(channel = %grant.channel_id, "subscription granted");
        Ok(grant)
    }

    /// Attach a receiver to an authorized channel.
    pub async fn open_channel(&self, channel_id: &str) -> broadcast::Receiver<ChannelMessage> {
        self.publisher.open_channel(channel_id).await
    }

    /// Current snapshot of a session.
    pub async fn snapshot(&self, session_id: &SessionId) -> Option<GameSession> {
        let shared = self.registry.get(session_id).await?;
        let entry = shared.read().await;
        Some(entry.session.clone())
    }

    /// Evict finished sessions past their grace period and abandoned
    /// in-progress sessions, and drop their channels. Returns the number
    /// evicted.
    pub async fn evict_expired(&self) -> usize {
        let expired = self.registry.evict_expired(Instant::now()).await;
        for id in &expired {
            self.publisher.close_session_channel(*id).await;
        }
        expired.len()
    }

    /// Get live session count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }

    fn authenticate(&self, token: &str) -> Result<TokenBinding, ServiceError> {
        self.tokens.verify(bearer_token(token)).map_err(|e| {
            warn!(reason = %e, "token rejected");
            ServiceError::Unauthorized
        })
    }
}

impl Default for GameService {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::game::events::GameEventKind;
    use crate::game::state::{GameStatus, PlayerId};
    use crate::network::publisher::ChannelKind;

    const SOCKET: &str = "1234.5678";

    fn service() -> GameService {
        GameService::new(ServiceConfig {
            strategy: AgentStrategy::FirstAvailable,
            ..Default::default()
        })
    }

    async fn pvp(service: &GameService) -> (GameResponse, GameResponse) {
        let a = service
            .join("a@x.com", GameMode::PlayerVsPlayer, InputType::Manual)
            .await
            .unwrap();
        let b = service
            .join("b@x.com", GameMode::PlayerVsPlayer, InputType::Manual)
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_join_computer() {
        let service = service();
        let response = service
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();

        let game = response.game;
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.players.len(), 2);
        assert_eq!(game.current_turn_player_id, Some(game.players[0].id));
        assert!(!response.token.is_empty());
    }

    #[tokio::test]
    async fn test_join_pvp_pairs_into_same_session() {
        let service = service();
        let (a, b) = pvp(&service).await;

        assert_eq!(a.game.status, GameStatus::WaitingForPlayer);
        assert_eq!(b.game.id, a.game.id);
        assert_eq!(b.game.status, GameStatus::InProgress);
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn test_join_invalid_email() {
        let service = service();
        let err = service
            .join("not-an-email", GameMode::PlayerVsPlayer, InputType::Manual)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidEmail(_)));
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(service.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_computer_replies_within_move() {
        let service = service();
        let response = service
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();
        let human = response.game.players[0].id;

        let game = service.make_move(Some(4), response.game.id, &response.token).await.unwrap();

        assert_eq!(game.moves.len(), 2);
        // First available after the centre is taken.
        assert_eq!(u8::from(game.moves[1].choice), 0);
        assert_eq!(game.current_turn_player_id, Some(human));
    }

    #[tokio::test]
    async fn test_row_win_finishes_session() {
        let service = service();
        let (a, b) = pvp(&service).await;
        let id = a.game.id;

        for (token, choice) in [(&a.token, 0), (&b.token, 3), (&a.token, 1), (&b.token, 4)] {
            service.make_move(Some(choice), id, token).await.unwrap();
        }
        let game = service.make_move(Some(2), id, &a.token).await.unwrap();

        assert_eq!(game.status, GameStatus::Finished);
        assert_eq!(game.winner_id, Some(game.players[0].id));
        assert_eq!(game.current_turn_player_id, None);

        // Nothing succeeds after the finish, whoever calls.
        for token in [&a.token, &b.token] {
            for choice in 0..9 {
                let err = service.make_move(Some(choice), id, token).await.unwrap_err();
                assert_eq!(err, ServiceError::GameFinished);
            }
        }
        assert_eq!(service.snapshot(&id).await.unwrap(), game);
    }

    #[tokio::test]
    async fn test_occupied_choice_leaves_state_unchanged() {
        let service = service();
        let (a, b) = pvp(&service).await;
        let id = a.game.id;

        service.make_move(Some(0), id, &a.token).await.unwrap();
        let before = service.snapshot(&id).await.unwrap();

        let err = service.make_move(Some(0), id, &b.token).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidChoice(_)));
        assert_eq!(service.snapshot(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_bad_choices_rejected() {
        let service = service();
        let (a, _) = pvp(&service).await;

        for choice in [None, Some(-1), Some(9), Some(i64::MAX)] {
            let err = service.make_move(choice, a.game.id, &a.token).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidChoice(_)), "{:?}", choice);
        }
    }

    #[tokio::test]
    async fn test_not_your_turn() {
        let service = service();
        let (a, b) = pvp(&service).await;

        let err = service.make_move(Some(0), a.game.id, &b.token).await.unwrap_err();
        assert_eq!(err, ServiceError::NotYourTurn);
        assert_eq!(err.category(), ErrorCategory::StateConflict);
    }

    #[tokio::test]
    async fn test_waiting_session_rejects_moves() {
        let service = service();
        let a = service
            .join("a@x.com", GameMode::PlayerVsPlayer, InputType::Manual)
            .await
            .unwrap();

        let err = service.make_move(Some(0), a.game.id, &a.token).await.unwrap_err();
        assert_eq!(err, ServiceError::NotYourTurn);
    }

    #[tokio::test]
    async fn test_token_checks() {
        let service = service();
        let (a, _) = pvp(&service).await;
        let other = service
            .join("c@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();

        // Garbage token.
        let err = service.make_move(Some(0), a.game.id, "garbage").await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);

        // Token bound to another session.
        let err = service.make_move(Some(0), a.game.id, &other.token).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);

        // Bearer prefix accepted.
        let bearer = format!("Bearer {}", a.token);
        assert!(service.make_move(Some(0), a.game.id, &bearer).await.is_ok());
    }

    #[tokio::test]
    async fn test_unseated_player_unauthorized() {
        let service = service();
        let (a, _) = pvp(&service).await;
        let stranger = service.tokens.issue(a.game.id, PlayerId::random()).unwrap();

        let err = service.make_move(Some(0), a.game.id, &stranger).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);
    }

    #[tokio::test]
    async fn test_session_not_found() {
        let service = service();
        let ghost = SessionId::random();
        let token = service.tokens.issue(ghost, PlayerId::random()).unwrap();

        let err = service.make_move(Some(0), ghost, &token).await.unwrap_err();
        assert_eq!(err, ServiceError::SessionNotFound);
        assert_eq!(err.code(), ErrorCode::SessionNotFound);

        let err = service.subscribe(SOCKET, None, &token).await.unwrap_err();
        assert_eq!(err, ServiceError::SessionNotFound);
    }

    #[tokio::test]
    async fn test_subscribe_grants_channel() {
        let service = service();
        let (a, _) = pvp(&service).await;

        let grant = service.subscribe(SOCKET, Some(a.game.id), &a.token).await.unwrap();
        assert_eq!(grant.channel_id, format!("private-game-{}", a.game.id));
        assert!(grant.auth.starts_with("noughts:"));
        assert!(grant.shared_secret.is_none());

        // Session inferred from the token.
        let inferred = service.subscribe(SOCKET, None, &a.token).await.unwrap();
        assert_eq!(inferred, grant);
    }

    #[tokio::test]
    async fn test_subscribe_refusals() {
        let service = service();
        let (a, b) = pvp(&service).await;
        let other = service
            .join("c@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();

        let err = service.subscribe("not-a-socket", None, &a.token).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);

        let err = service.subscribe(SOCKET, Some(other.game.id), &a.token).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);

        // Finished sessions no longer grant access.
        let id = a.game.id;
        let row = [(&a.token, 0), (&b.token, 3), (&a.token, 1), (&b.token, 4), (&a.token, 2)];
        for (token, choice) in row {
            service.make_move(Some(choice), id, token).await.unwrap();
        }
        let err = service.subscribe(SOCKET, None, &b.token).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized);
    }

    #[tokio::test]
    async fn test_encrypted_channel_returns_shared_secret() {
        let service = GameService::new(ServiceConfig {
            channels: ChannelConfig {
                kind: ChannelKind::Encrypted,
                encryption_master_key: Some([7u8; 32]),
                ..Default::default()
            },
            ..Default::default()
        });
        let response = service
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();

        let grant = service.subscribe(SOCKET, None, &response.token).await.unwrap();
        assert!(grant.channel_id.starts_with("private-encrypted-game-"));
        assert!(grant.shared_secret.is_some());
    }

    #[tokio::test]
    async fn test_moves_published_to_subscribers() {
        let service = service();
        let response = service
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();
        let grant = service.subscribe(SOCKET, None, &response.token).await.unwrap();
        let mut rx = service.open_channel(&grant.channel_id).await;

        service.make_move(Some(4), response.game.id, &response.token).await.unwrap();

        // Human move, then the computer's reply.
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, GameEventKind::TurnPlayed);
        assert_eq!(first.data.moves.len(), 1);
        assert_eq!(second.event, GameEventKind::TurnPlayed);
        assert_eq!(second.data.moves.len(), 2);
    }

    #[tokio::test]
    async fn test_finished_sessions_evicted() {
        let service = GameService::new(ServiceConfig {
            registry: RegistryConfig {
                finished_grace: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        });
        let (a, b) = pvp(&service).await;
        let waiting = service
            .join("c@x.com", GameMode::PlayerVsPlayer, InputType::Manual)
            .await
            .unwrap();
        let id = a.game.id;

        service.subscribe(SOCKET, None, &a.token).await.unwrap();
        let mut rx = service.open_channel(&format!("private-game-{}", id)).await;

        let row = [(&a.token, 0), (&b.token, 3), (&a.token, 1), (&b.token, 4), (&a.token, 2)];
        for (token, choice) in row {
            service.make_move(Some(choice), id, token).await.unwrap();
        }
        while let Ok(message) = rx.try_recv() {
            assert_eq!(message.data.id, id);
        }

        assert_eq!(service.evict_expired().await, 1);
        assert!(service.snapshot(&id).await.is_none());
        assert!(service.snapshot(&waiting.game.id).await.is_some());
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));

        let err = service.make_move(Some(5), id, &b.token).await.unwrap_err();
        assert_eq!(err, ServiceError::SessionNotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_moves_serialized() {
        let service = Arc::new(service());
        let (a, b) = pvp(&service).await;
        let id = a.game.id;

        // Both players race for every cell; exactly one move per turn lands.
        let mut handles = Vec::new();
        for choice in 0..9 {
            for token in [a.token.clone(), b.token.clone()] {
                let service = service.clone();
                handles.push(tokio::spawn(async move {
                    service.make_move(Some(choice), id, &token).await
                }));
            }
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let game = service.snapshot(&id).await.unwrap();
        assert!(game.check_invariants().is_ok());
        for pair in game.moves.windows(2) {
            assert_ne!(pair[0].player_id, pair[1].player_id);
        }
    }
}
