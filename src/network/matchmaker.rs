//! Matchmaker
//!
//! Seats joining players. PLAYER_VS_COMPUTER sessions start immediately
//! against a synthetic AUTOMATIC player; PLAYER_VS_PLAYER joins fill the
//! oldest open seat or open a new session.
//!
//! The PLAYER_VS_PLAYER scan and seat assignment run under the registry's
//! waiting-list lock, so two concurrent joiners can never take the same seat.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::game::agent::ComputerAgent;
use crate::game::arbiter::{play_automatic_turns, MoveError};
use crate::game::events::GameEvent;
use crate::game::state::{
    GameMode, GameSession, GameStatus, InputType, Player, PlayerId, PLAYERS_PER_SESSION,
};
use crate::network::publisher::EventPublisher;
use crate::network::session::{SessionEntry, SessionRegistry, SharedSession};

/// Email of the synthetic computer opponent.
pub const COMPUTER_EMAIL: &str = "computer@noughts.local";

/// Longest accepted email address.
pub const MAX_EMAIL_LEN: usize = 254;

/// Join errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// Email failed format validation.
    #[error("invalid email: {0}")]
    InvalidEmail(String),
    /// A third player would have been seated.
    #[error("session capacity exceeded")]
    SessionCapacityExceeded,
    /// Automatic opening moves failed.
    #[error(transparent)]
    Move(#[from] MoveError),
}

/// A completed join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Session snapshot after the join.
    pub session: GameSession,
    /// Id assigned to the joining player.
    pub player_id: PlayerId,
}

/// Pairs players into sessions.
pub struct Matchmaker {
    registry: Arc<SessionRegistry>,
    publisher: Arc<EventPublisher>,
    agent: Arc<dyn ComputerAgent>,
}

impl Matchmaker {
    /// Create a matchmaker over shared components.
    pub fn new(
        registry: Arc<SessionRegistry>,
        publisher: Arc<EventPublisher>,
        agent: Arc<dyn ComputerAgent>,
    ) -> Self {
        Self {
            registry,
            publisher,
            agent,
        }
    }

    /// Seat a player according to `mode`.
    #[instrument(skip(self, email), fields(mode = ?mode, input = ?input_type))]
    pub async fn join(
        &self,
        email: &str,
        mode: GameMode,
        input_type: InputType,
    ) -> Result<JoinOutcome, JoinError> {
        let email = normalize_email(email)?;
        let player = Player::new(email, input_type);

        match mode {
            GameMode::PlayerVsComputer => self.join_computer(player).await,
            GameMode::PlayerVsPlayer => self.join_player(player).await,
        }
    }

    async fn join_computer(&self, player: Player) -> Result<JoinOutcome, JoinError> {
        let player_id = player.id;
        let shared = self.registry.create(GameMode::PlayerVsComputer, player).await;
        let mut entry = shared.write().await;

        let computer = Player::new(COMPUTER_EMAIL, InputType::Automatic);
        let events = self.start(&mut entry, computer)?;
        self.publisher.publish_all(entry.session.id, &events).await;

        info!(
            session_id = %entry.session.id,
            number = entry.session.number,
            "computer session started"
        );
        Ok(JoinOutcome {
            session: entry.session.clone(),
            player_id,
        })
    }

    async fn join_player(&self, player: Player) -> Result<JoinOutcome, JoinError> {
        let player_id = player.id;
        let mut waiting = self.registry.waiting().await;

        let mut i = 0;
        while i < waiting.len() {
            let id = waiting[i];
            let Some(shared) = self.registry.get(&id).await else {
                waiting.remove(i);
                continue;
            };
            let mut entry = shared.write().await;

            let open = entry.session.status == GameStatus::WaitingForPlayer
                && entry.session.mode == GameMode::PlayerVsPlayer;
            if !open {
                waiting.remove(i);
                continue;
            }
            if entry.session.has_email(&player.email) {
                i += 1;
                continue;
            }

            let events = self.start(&mut entry, player)?;
            waiting.remove(i);
            self.publisher.publish_all(id, &events).await;

            info!(session_id = %id, number = entry.session.number, "player session started");
            return Ok(JoinOutcome {
                session: entry.session.clone(),
                player_id,
            });
        }

        let shared: SharedSession = self.registry.create(GameMode::PlayerVsPlayer, player).await;
        let session = shared.read().await.session.clone();
        waiting.push(session.id);

        info!(session_id = %session.id, number = session.number, "waiting for opponent");
        Ok(JoinOutcome { session, player_id })
    }

    /// Seat the second player, start the session and run automatic openers.
    ///
    /// On error the session is left as it was.
    fn start(&self, entry: &mut SessionEntry, second: Player) -> Result<Vec<GameEvent>, JoinError> {
        if entry.session.players.len() >= PLAYERS_PER_SESSION {
            return Err(JoinError::SessionCapacityExceeded);
        }

        let snapshot = entry.session.clone();
        match Self::seat(&mut entry.session, second, self.agent.as_ref()) {
            Ok(events) => {
                entry.record_activity();
                Ok(events)
            }
            Err(e) => {
                entry.session = snapshot;
                Err(e.into())
            }
        }
    }

    fn seat(
        session: &mut GameSession,
        second: Player,
        agent: &dyn ComputerAgent,
    ) -> Result<Vec<GameEvent>, MoveError> {
        session.players.push(second);
        session.status = GameStatus::InProgress;
        // First-joined player moves first; in computer sessions that is the human.
        session.current_turn_player_id = Some(session.players[0].id);
        session.touch();

        let mut events = vec![GameEvent::joined(session), GameEvent::started(session)];
        events.extend(play_automatic_turns(session, agent)?);
        Ok(events)
    }
}

/// Trim, lowercase and validate an email address.
pub fn normalize_email(raw: &str) -> Result<String, JoinError> {
    let email = raw.trim().to_lowercase();
    let invalid = || JoinError::InvalidEmail(raw.trim().to_string());

    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let dotted = domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.');
    if !dotted || domain.contains("..") {
        return Err(invalid());
    }

    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::agent::Minimax;
    use crate::game::events::GameEventKind;
    use crate::network::session::RegistryConfig;

    fn matchmaker() -> (Matchmaker, Arc<SessionRegistry>, Arc<EventPublisher>) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let publisher = Arc::new(EventPublisher::default());
        let mm = Matchmaker::new(registry.clone(), publisher.clone(), Arc::new(Minimax));
        (mm, registry, publisher)
    }

    #[test]
    fn test_email_validation() {
        assert_eq!(normalize_email("  A@X.com "), Ok("a@x.com".to_string()));
        let bad_emails = [
            "", "ax.com", "@x.com", "a@", "a@x", "a@.com", "a@x.", "a b@x.com", "a@@x.com",
            "a@x..com",
        ];
        for bad in bad_emails {
            assert!(matches!(normalize_email(bad), Err(JoinError::InvalidEmail(_))), "{:?}", bad);
        }
        let long = format!("{}@x.com", "a".repeat(MAX_EMAIL_LEN));
        assert!(normalize_email(&long).is_err());
    }

    #[tokio::test]
    async fn test_computer_session_starts_immediately() {
        let (mm, _, _) = matchmaker();

        let outcome = mm
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();
        let session = outcome.session;

        assert_eq!(session.status, GameStatus::InProgress);
        assert_eq!(session.players.len(), 2);
        assert_eq!(session.current_turn_player_id, Some(outcome.player_id));
        assert_eq!(session.players[1].input_type, InputType::Automatic);
        assert!(session.moves.is_empty());
    }

    #[tokio::test]
    async fn test_second_player_joins_first_session() {
        let (mm, registry, _) = matchmaker();

        let first = mm.join("a@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();
        assert_eq!(first.session.status, GameStatus::WaitingForPlayer);
        assert_eq!(registry.waiting_count().await, 1);

        let second = mm.join("b@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.status, GameStatus::InProgress);
        assert_eq!(second.session.current_turn_player_id, Some(first.player_id));
        assert_eq!(registry.waiting_count().await, 0);
    }

    #[tokio::test]
    async fn test_same_email_not_paired_with_itself() {
        let (mm, registry, _) = matchmaker();

        let first = mm.join("a@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();
        let again = mm.join("A@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();

        assert_ne!(first.session.id, again.session.id);
        assert_eq!(again.session.status, GameStatus::WaitingForPlayer);
        assert_eq!(registry.waiting_count().await, 2);
    }

    #[tokio::test]
    async fn test_invalid_email_leaves_no_trace() {
        let (mm, registry, _) = matchmaker();
        let result = mm.join("nope", GameMode::PlayerVsPlayer, InputType::Manual).await;

        assert!(matches!(result, Err(JoinError::InvalidEmail(_))));
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(registry.waiting_count().await, 0);
    }

    #[tokio::test]
    async fn test_third_seat_rejected() {
        let (mm, registry, _) = matchmaker();
        let outcome = mm
            .join("a@x.com", GameMode::PlayerVsComputer, InputType::Manual)
            .await
            .unwrap();

        let shared = registry.get(&outcome.session.id).await.unwrap();
        let mut entry = shared.write().await;
        let before = entry.session.clone();
        let result = mm.start(&mut entry, Player::new("c@x.com", InputType::Manual));

        assert_eq!(result.unwrap_err(), JoinError::SessionCapacityExceeded);
        assert_eq!(entry.session, before);
    }

    #[tokio::test]
    async fn test_join_events_published() {
        let (mm, _, publisher) = matchmaker();

        let first = mm.join("a@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();
        let mut rx = publisher.open_channel(&publisher.channel_id(first.session.id)).await;
        mm.join("b@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event, GameEventKind::Joined);
        assert_eq!(rx.recv().await.unwrap().event, GameEventKind::Started);
    }

    #[tokio::test]
    async fn test_automatic_first_player_opens() {
        let (mm, _, _) = matchmaker();

        mm.join("a@x.com", GameMode::PlayerVsPlayer, InputType::Automatic).await.unwrap();
        let second = mm.join("b@x.com", GameMode::PlayerVsPlayer, InputType::Manual).await.unwrap();

        assert_eq!(second.session.moves.len(), 1);
        assert_eq!(second.session.current_turn_player_id, Some(second.player_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_never_share_a_seat() {
        let (mm, registry, _) = matchmaker();
        let mm = Arc::new(mm);

        let mut handles = Vec::new();
        for i in 0..40 {
            let mm = mm.clone();
            handles.push(tokio::spawn(async move {
                mm.join(&format!("p{}@x.com", i), GameMode::PlayerVsPlayer, InputType::Manual)
                    .await
                    .unwrap()
            }));
        }

        let mut seats = std::collections::BTreeMap::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            *seats.entry(outcome.session.id).or_insert(0usize) += 1;
        }

        // 40 joiners fill exactly 20 sessions with 2 each.
        assert_eq!(seats.len(), 20);
        assert!(seats.values().all(|&n| n == 2));
        assert_eq!(registry.waiting_count().await, 0);

        for id in seats.keys() {
            let shared = registry.get(id).await.unwrap();
            let entry = shared.read().await;
            assert_eq!(entry.session.players.len(), 2);
            assert!(entry.session.check_invariants().is_ok());
        }
    }
}
