//! Session Tokens
//!
//! Issues and validates HS256 JWTs that bind a player to one session.
//! Tokens carry no mutable state; validation is pure.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::game::state::{PlayerId, SessionId};

/// Default token lifetime (inactivity bound).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Issuer claim ("iss") written into and required on every token.
    pub issuer: String,
    /// HS256 signing secret.
    pub secret: Vec<u8>,
    /// Token lifetime from issuance.
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            issuer: "noughts-server".into(),
            secret,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secret = match std::env::var("AUTH_SECRET") {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                warn!("AUTH_SECRET not set, tokens will not survive a restart");
                defaults.secret
            }
        };

        Self {
            issuer: std::env::var("AUTH_ISSUER").unwrap_or(defaults.issuer),
            secret,
            token_ttl: std::env::var("TOKEN_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_ttl),
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the player id.
    pub sub: String,
    /// Session the player is bound to.
    pub sid: String,
    /// Expiry timestamp (Unix seconds).
    pub exp: u64,
    /// Issued at timestamp.
    pub iat: u64,
    /// Issuer.
    pub iss: String,
}

impl TokenClaims {
    /// Parsed player id.
    pub fn player_id(&self) -> Option<PlayerId> {
        PlayerId::from_uuid_str(&self.sub)
    }

    /// Parsed session id.
    pub fn session_id(&self) -> Option<SessionId> {
        SessionId::from_uuid_str(&self.sid)
    }
}

/// Identity recovered from a valid token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBinding {
    /// Bound session.
    pub session_id: SessionId,
    /// Bound player.
    pub player_id: PlayerId,
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Required claim is missing or malformed.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Signing failed.
    #[error("encode error: {0}")]
    EncodeError(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Mints and verifies session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    issuer: String,
    token_ttl: Duration,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Build an issuer from configuration.
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            issuer: config.issuer.clone(),
            token_ttl: config.token_ttl,
            encoding: EncodingKey::from_secret(&config.secret),
            decoding: DecodingKey::from_secret(&config.secret),
            validation,
        }
    }

    /// Mint a token scoping `player_id` to `session_id`.
    pub fn issue(&self, session_id: SessionId, player_id: PlayerId) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = TokenClaims {
            sub: player_id.to_string(),
            sid: session_id.to_string(),
            iat: now,
            exp: now + self.token_ttl.as_secs(),
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::EncodeError(e.to_string()))
    }

    /// Validate a token and recover its binding.
    pub fn verify(&self, token: &str) -> Result<TokenBinding, AuthError> {
        let token_data: TokenData<TokenClaims> =
            decode(token, &self.decoding, &self.validation).map_err(map_jwt_error)?;
        let claims = token_data.claims;

        let player_id = claims
            .player_id()
            .ok_or_else(|| AuthError::MissingClaim("sub".into()))?;
        let session_id = claims
            .session_id()
            .ok_or_else(|| AuthError::MissingClaim("sid".into()))?;

        Ok(TokenBinding { session_id, player_id })
    }
}

/// Strip an optional `Bearer ` prefix from a credential.
pub fn bearer_token(credential: &str) -> &str {
    let trimmed = credential.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
