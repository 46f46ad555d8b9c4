//! WebSocket Game Server
//!
//! Async WebSocket binding for the game service. Each connection gets a
//! socket id for channel authorization; subscribed channel events are
//! forwarded onto the same socket.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::publisher::ChannelMessage;
use crate::network::service::GameService;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    /// How often finished sessions are evicted.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            cleanup_interval: secs("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// Connected client state.
struct ConnectedClient {
    /// Socket id handed out on connect.
    socket_id: String,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// Per-connection channel forwarders, by channel id.
type Forwarders = BTreeMap<String, JoinHandle<()>>;

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session service.
    service: Arc<GameService>,
    /// Connected clients.
    clients: Clients,
    /// Socket id prefix, random per process.
    socket_prefix: u32,
    /// Socket id sequence.
    next_socket: AtomicU64,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, service: Arc<GameService>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            service,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            socket_prefix: rand::random::<u32>() % 1_000_000,
            next_socket: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Bind and run the server until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let local_addr = listener.local_addr()?;
        info!(version = %self.config.version, "Game server listening on {}", local_addr);

        let cleanup_service = self.service.clone();
        let cleanup_interval = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_service, cleanup_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(Self::reject(stream, addr));
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Tell an over-limit client why it is being dropped.
    async fn reject(stream: TcpStream, addr: SocketAddr) {
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        let message = ServerMessage::error(
            ErrorCode::ServerFull,
            GameServerError::ConnectionLimitReached.to_string(),
        );
        if let Ok(text) = message.to_json() {
            let _ = ws.send(Message::Text(text)).await;
        }
        let _ = ws.close(None).await;
        debug!("Rejected {}", addr);
    }

    /// Handle a new WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let service = self.service.clone();
        let idle_timeout = self.config.idle_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let sequence = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let socket_id = format!("{}.{}", self.socket_prefix, sequence);

        // Register before the handshake so the connection limit counts it.
        clients.write().await.insert(addr, ConnectedClient {
            socket_id: socket_id.clone(),
            connected_at: Instant::now(),
            last_activity: Instant::now(),
        });

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&addr);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let mut forwarders = Forwarders::new();

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let _ = msg_tx
                .send(ServerMessage::Connected {
                    socket_id: socket_id.clone(),
                })
                .await;

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = timeout(idle_timeout, ws_receiver.next()) => {
                        let Ok(msg) = msg else {
                            info!(%socket_id, "Closing idle connection {}", addr);
                            break;
                        };
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let reply = ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            e.to_string(),
                                        );
                                        let _ = msg_tx.send(reply).await;
                                        continue;
                                    }
                                };

                                // Update activity
                                if let Some(client) = clients.write().await.get_mut(&addr) {
                                    client.last_activity = Instant::now();
                                }

                                let reply = Self::handle_client_message(
                                    &service,
                                    &socket_id,
                                    client_msg,
                                    &msg_tx,
                                    &mut forwarders,
                                ).await;
                                if msg_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            for (_, forwarder) in forwarders {
                forwarder.abort();
            }
            drop(msg_tx);
            if timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Sender for {} did not drain in time", addr);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    socket_id = %client.socket_id,
                    connected_secs = client.connected_at.elapsed().as_secs(),
                    idle_secs = client.last_activity.elapsed().as_secs(),
                    "Client {} cleaned up",
                    addr
                );
            }
        });
    }

    /// Handle a client message and produce the direct reply.
    async fn handle_client_message(
        service: &Arc<GameService>,
        socket_id: &str,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
        forwarders: &mut Forwarders,
    ) -> ServerMessage {
        let result = match msg {
            ClientMessage::Join(req) => service
                .join(&req.email, req.mode, req.input_type)
                .await
                .map(ServerMessage::Joined),
            ClientMessage::MakeMove(req) => service
                .make_move(req.choice, req.game_id, &req.token)
                .await
                .map(ServerMessage::Game),
            ClientMessage::Subscribe(req) => {
                match service.subscribe(socket_id, req.game_id, &req.token).await {
                    Ok(grant) => {
                        forwarders.retain(|_, task| !task.is_finished());
                        if !forwarders.contains_key(&grant.channel_id) {
                            let rx = service.open_channel(&grant.channel_id).await;
                            let task = tokio::spawn(Self::forward_channel(rx, sender.clone()));
                            forwarders.insert(grant.channel_id.clone(), task);
                        }
                        Ok(ServerMessage::Subscribed(grant))
                    }
                    Err(e) => Err(e),
                }
            }
            ClientMessage::Ping { timestamp } => Ok(ServerMessage::Pong {
                timestamp,
                server_time: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            }),
        };

        result.unwrap_or_else(|e| ServerMessage::error(e.code(), e.to_string()))
    }

    /// Push channel events onto a client's socket until either side closes.
    async fn forward_channel(
        mut rx: broadcast::Receiver<ChannelMessage>,
        sender: mpsc::Sender<ServerMessage>,
    ) {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if sender.send(ServerMessage::Event(message)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Periodically evict finished sessions.
    async fn run_cleanup_loop(service: Arc<GameService>, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let evicted = service.evict_expired().await;
            if evicted > 0 {
                debug!(evicted, "Cleanup pass");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get live session count.
    pub async fn session_count(&self) -> usize {
        self.service.session_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::agent::AgentStrategy;
    use crate::game::events::GameEventKind;
    use crate::game::state::{GameMode, GameStatus, InputType};
    use crate::network::protocol::{JoinRequest, MoveRequest, SubscribeRequest};
    use crate::network::service::ServiceConfig;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: ServerConfig) -> (Arc<GameServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(GameService::new(ServiceConfig {
            strategy: AgentStrategy::FirstAvailable,
            ..Default::default()
        }));
        let server = Arc::new(GameServer::new(config, service));

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for server")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(ServerConfig::default(), Arc::new(GameService::default()));

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_computer_game_over_websocket() {
        let (server, addr) = start(ServerConfig::default()).await;
        let mut ws = connect(addr).await;

        let ServerMessage::Connected { socket_id } = recv(&mut ws).await else {
            panic!("expected connected");
        };
        assert_eq!(server.connection_count().await, 1);

        send(&mut ws, ClientMessage::Join(JoinRequest {
            email: "a@x.com".into(),
            mode: GameMode::PlayerVsComputer,
            input_type: InputType::Manual,
        })).await;
        let ServerMessage::Joined(joined) = recv(&mut ws).await else {
            panic!("expected joined");
        };
        assert_eq!(joined.game.status, GameStatus::InProgress);

        send(&mut ws, ClientMessage::Subscribe(SubscribeRequest {
            token: joined.token.clone(),
            game_id: None,
        })).await;
        let ServerMessage::Subscribed(grant) = recv(&mut ws).await else {
            panic!("expected subscribed");
        };
        assert!(grant.channel_id.ends_with(&joined.game.id.to_string()));
        assert!(socket_id.contains('.'));

        send(&mut ws, ClientMessage::MakeMove(MoveRequest {
            choice: Some(4),
            game_id: joined.game.id,
            token: joined.token.clone(),
        })).await;

        // Direct reply and channel events may interleave.
        let mut game = None;
        let mut events = Vec::new();
        while game.is_none() || events.len() < 2 {
            match recv(&mut ws).await {
                ServerMessage::Game(session) => game = Some(session),
                ServerMessage::Event(message) => events.push(message.event),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(game.unwrap().moves.len(), 2);
        assert_eq!(events, vec![GameEventKind::TurnPlayed, GameEventKind::TurnPlayed]);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_errors_reported() {
        let (server, addr) = start(ServerConfig::default()).await;
        let mut ws = connect(addr).await;
        recv(&mut ws).await;

        ws.send(Message::Text("{\"type\":\"bogus\"}".into())).await.unwrap();
        let ServerMessage::Error(error) = recv(&mut ws).await else {
            panic!("expected error");
        };
        assert_eq!(error.code, ErrorCode::InvalidMessage);

        send(&mut ws, ClientMessage::Join(JoinRequest {
            email: "bad".into(),
            mode: GameMode::PlayerVsPlayer,
            input_type: InputType::Manual,
        })).await;
        let ServerMessage::Error(error) = recv(&mut ws).await else {
            panic!("expected error");
        };
        assert_eq!(error.code, ErrorCode::InvalidEmail);

        send(&mut ws, ClientMessage::Ping { timestamp: 9 }).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::Pong { timestamp: 9, .. }));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (server, addr) = start(ServerConfig::default()).await;
        let mut ws = connect(addr).await;
        recv(&mut ws).await;

        server.shutdown();
        assert!(matches!(recv(&mut ws).await, ServerMessage::Shutdown { .. }));
    }

    #[tokio::test]
    async fn test_over_limit_client_gets_server_full() {
        let (server, addr) = start(ServerConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await;
        let mut first = connect(addr).await;
        assert!(matches!(recv(&mut first).await, ServerMessage::Connected { .. }));

        let mut second = connect(addr).await;
        let ServerMessage::Error(error) = recv(&mut second).await else {
            panic!("expected error");
        };
        assert_eq!(error.code, ErrorCode::ServerFull);
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let (server, addr) = start(ServerConfig {
            idle_timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .await;
        let mut ws = connect(addr).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::Connected { .. }));

        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("idle connection was not closed");
        assert!(matches!(frame, None | Some(Ok(Message::Close(_)))), "{:?}", frame);

        let mut remaining = server.connection_count().await;
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = server.connection_count().await;
        }
        assert_eq!(remaining, 0);

        server.shutdown();
    }
}
