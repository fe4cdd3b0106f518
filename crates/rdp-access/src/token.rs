//! Access and refresh token mint/verify
//!
//! Tokens are HS256-signed JWTs. Verification pins the algorithm: the
//! header's `alg` is never trusted, so `none` and asymmetric algorithms are
//! refused outright.
//!
//! Checks run in this order and stop at the first failure:
//! 1. shape (three non-empty segments)
//! 2. algorithm, signature, issuer and audience
//! 3. `nbf` and `exp` against the injected clock, with the configured leeway
//! 4. revocation (the principal's revoke-all mark, then the session row)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use ulid::Ulid;

use rdp_types::{new_id, parse_id, ErrorKind, Principal, PrincipalId, SessionId, SharedClock};

use crate::request::codes;
use crate::session::{SessionError, SessionOrigin, SessionStore};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Largest accepted clock-skew tolerance
pub const MAX_LEEWAY: Duration = Duration::from_secs(60);

/// Token failure
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token audience mismatch")]
    WrongAudience,

    #[error("token revoked")]
    Revoked,

    #[error("principal {0} is unknown or inactive")]
    UnknownPrincipal(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("principal lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

impl TokenError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Signing(_) | Self::Session(_) | Self::Lookup(_) => ErrorKind::Internal,
            _ => ErrorKind::Unauthenticated,
        }
    }

    /// Envelope code for a failed access-token check.
    ///
    /// Expiry and revocation get their own codes; every cryptographic or
    /// shape failure shares one so callers cannot tell which check failed.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Expired => codes::TOKEN_EXPIRED,
            Self::Revoked => codes::TOKEN_REVOKED,
            Self::Signing(_) | Self::Session(_) | Self::Lookup(_) => codes::INTERNAL,
            _ => codes::INVALID_TOKEN,
        }
    }

    /// Message shown to callers; identical for every rejection
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Internal => "error verifying token",
            _ => "invalid or expired token",
        }
    }
}

/// Principal lookup failure
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Current view of a principal, consulted on refresh
#[async_trait]
pub trait PrincipalLookup: Send + Sync {
    async fn lookup(&self, id: PrincipalId) -> Result<Option<Principal>, LookupError>;
}

/// Which kind of token a caller expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Access,
    Refresh,
}

/// Signing and lifetime settings
#[derive(Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub leeway: Duration,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("leeway", &self.leeway)
            .finish()
    }
}

impl TokenConfig {
    /// Create new config with the default issuer, audience and lifetimes
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: "rdp-api".into(),
            audience: "rdp-users".into(),
            access_ttl: Duration::from_secs(2 * 60 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            leeway: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// Applied to both `nbf` and `exp`; capped at [`MAX_LEEWAY`]
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway.min(MAX_LEEWAY);
        self
    }

    /// Audience carried by refresh tokens
    #[must_use]
    pub fn refresh_audience(&self) -> String {
        format!("{}/refresh", self.audience)
    }
}

/// JWT claim set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Monotonic ULID, unique per token; orders tokens against revoke-all marks
    pub jti: String,
}

impl Claims {
    /// Principal id carried in `sub`
    pub fn principal(&self) -> Result<PrincipalId, TokenError> {
        self.sub.parse().map_err(|_| TokenError::Malformed)
    }

    /// Monotonic token id carried in `jti`
    pub fn token_id(&self) -> Result<Ulid, TokenError> {
        parse_id(&self.jti).map_err(|_| TokenError::Malformed)
    }

    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or_default()
    }
}

/// Minted access and refresh tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    pub session_id: SessionId,
}

/// Hex SHA-256 of the token string
#[must_use]
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn is_compact(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

fn unix(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Mints, verifies and refreshes tokens
pub struct TokenService {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    access: Validation,
    refresh: Validation,
    sessions: Arc<dyn SessionStore>,
    clock: SharedClock,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

fn validation(issuer: &str, audience: &str) -> Validation {
    let mut validation = Validation::new(ALGORITHM);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "nbf", "aud", "iss", "sub"]);
    // Time checks run against the injected clock instead
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.leeway = 0;
    validation
}

impl TokenService {
    /// Create new token service
    #[must_use]
    pub fn new(config: TokenConfig, sessions: Arc<dyn SessionStore>, clock: SharedClock) -> Self {
        let access = validation(&config.issuer, &config.audience);
        let refresh = validation(&config.issuer, &config.refresh_audience());
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            access,
            refresh,
            config,
            sessions,
            clock,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(ALGORITHM), claims, &self.encoding)
            .map_err(|err| TokenError::Signing(err.to_string()))
    }

    /// Mint an access/refresh pair and record the access session
    pub async fn mint_pair(
        &self,
        principal: PrincipalId,
        name: &str,
        role: &str,
    ) -> Result<TokenPair, TokenError> {
        self.mint_pair_with_origin(principal, name, role, &SessionOrigin::default())
            .await
    }

    #[instrument(skip(self, name, origin))]
    pub async fn mint_pair_with_origin(
        &self,
        principal: PrincipalId,
        name: &str,
        role: &str,
        origin: &SessionOrigin,
    ) -> Result<TokenPair, TokenError> {
        let issued = unix(self.clock.now());
        let iat = issued.timestamp();
        let access_secs = i64::try_from(self.config.access_ttl.as_secs()).unwrap_or(i64::MAX);
        let refresh_secs = i64::try_from(self.config.refresh_ttl.as_secs()).unwrap_or(i64::MAX);

        let access = Claims {
            sub: principal.to_string(),
            name: Some(name.to_string()),
            role: Some(role.to_string()),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat,
            nbf: iat,
            exp: iat.saturating_add(access_secs),
            jti: new_id().to_string(),
        };
        let refresh = Claims {
            sub: principal.to_string(),
            name: None,
            role: None,
            iss: self.config.issuer.clone(),
            aud: self.config.refresh_audience(),
            iat,
            nbf: iat,
            exp: iat.saturating_add(refresh_secs),
            jti: new_id().to_string(),
        };
        let access_token = self.sign(&access)?;
        let refresh_token = self.sign(&refresh)?;

        let expires_at = DateTime::from_timestamp(access.exp, 0).unwrap_or(issued);
        let session = self
            .sessions
            .record(principal, &fingerprint(&access_token), issued, expires_at, origin)
            .await?;
        info!(%principal, session = %session.id, "token pair minted");

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".into(),
            expires_in: self.config.access_ttl.as_secs(),
            session_id: session.id,
        })
    }

    fn decode(&self, token: &str, audience: Audience) -> Result<Claims, TokenError> {
        if !is_compact(token) {
            return Err(TokenError::Malformed);
        }
        let validation = match audience {
            Audience::Access => &self.access,
            Audience::Refresh => &self.refresh,
        };
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, validation).map_err(
            |err| match err.kind() {
                JwtErrorKind::InvalidToken => TokenError::Malformed,
                JwtErrorKind::InvalidAudience => TokenError::WrongAudience,
                _ => TokenError::BadSignature,
            },
        )?;
        let claims = data.claims;

        let now = self.clock.now().timestamp();
        let leeway = i64::try_from(self.config.leeway.as_secs()).unwrap_or(0);
        if now.saturating_add(leeway) < claims.nbf {
            return Err(TokenError::NotYetValid);
        }
        if now >= claims.exp.saturating_add(leeway) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Check a token and return its claims
    pub async fn verify(&self, token: &str, audience: Audience) -> Result<Claims, TokenError> {
        let claims = self.decode(token, audience)?;
        let principal = claims.principal()?;

        if let Some(mark) = self.sessions.revocation_mark(principal).await? {
            if claims.token_id()? <= mark {
                return Err(TokenError::Revoked);
            }
        }
        if audience == Audience::Access {
            let print = fingerprint(token);
            if self.sessions.is_revoked(&print).await? {
                return Err(TokenError::Revoked);
            }
            if let Err(err) = self.sessions.touch(&print, self.clock.now()).await {
                debug!(error = %err, "session touch failed");
            }
        }
        Ok(claims)
    }

    /// Verify an access token
    pub async fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, Audience::Access).await
    }

    /// Exchange a refresh token for a fresh pair carrying the current name and role
    pub async fn refresh(
        &self,
        refresh_token: &str,
        lookup: &dyn PrincipalLookup,
    ) -> Result<TokenPair, TokenError> {
        self.refresh_with_origin(refresh_token, lookup, &SessionOrigin::default())
            .await
    }

    #[instrument(skip_all)]
    pub async fn refresh_with_origin(
        &self,
        refresh_token: &str,
        lookup: &dyn PrincipalLookup,
        origin: &SessionOrigin,
    ) -> Result<TokenPair, TokenError> {
        let claims = self.verify(refresh_token, Audience::Refresh).await?;
        let id = claims.principal()?;
        let principal = match lookup.lookup(id).await? {
            Some(principal) if principal.active => principal,
            _ => return Err(TokenError::UnknownPrincipal(claims.sub)),
        };
        self.mint_pair_with_origin(principal.id, &principal.name, &principal.role, origin)
            .await
    }

    /// Revoke the session of one presented access token
    pub async fn revoke(&self, token: &str) -> Result<bool, TokenError> {
        Ok(self.sessions.revoke(&fingerprint(token)).await?)
    }

    /// Revoke every session and outstanding refresh token of a principal
    pub async fn revoke_all(&self, principal: PrincipalId) -> Result<usize, TokenError> {
        let revoked = self.sessions.revoke_all(principal).await?;
        info!(%principal, revoked, "all sessions revoked");
        Ok(revoked)
    }
}
