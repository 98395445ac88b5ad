//! The token gate: minting and verifying the signed session tokens, the
//! revocation check, and the per-endpoint principal allow-sets.
//!
//! Tokens are HS256 JSON web tokens signed with the shared `JWT_SECRET`.
//! Verification alone is not enough to accept one: the `jti` is looked up in
//! the session store's revocation set, and the claimed principal kind must
//! be in the endpoint's allow-set. The error phrases here are part of the
//! HTTP contract, so change them with care.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use hyper::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{ClientType, TokenId, User, UserId};
use crate::error::ApiError;
use crate::kvs::SessionStore;

/// Verified claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer: which principal kind minted the token.
    pub iss: ClientType,
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    /// Token id, the unit of revocation.
    pub jti: TokenId,
    /// Principal kind checked against endpoint allow-sets.
    pub typ: ClientType,
    pub uid: UserId,
    /// Nickname, echoed into published events.
    pub nic: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Gate every authenticated endpoint goes through.
pub struct TokenGate {
    secret: String,
    expiration: Duration,
    kvs: Arc<dyn SessionStore>,
}

impl TokenGate {
    #[must_use]
    pub fn new(secret: String, expiration: Duration, kvs: Arc<dyn SessionStore>) -> Self {
        TokenGate {
            secret,
            expiration,
            kvs,
        }
    }

    /// Mint a token for a logged-in user. Admin accounts get the `admin`
    /// principal kind, everyone else `player`.
    ///
    /// # Errors
    /// Returns `Unavailable` if signing fails.
    pub fn mint_user_token(&self, user: &User) -> Result<String, ApiError> {
        let typ = if user.is_admin { ClientType::Admin } else { ClientType::Player };
        self.mint(typ, user.userid, Some(user.name.clone()))
    }

    /// Mint a short-lived service token, e.g. for the logout self-call.
    ///
    /// # Errors
    /// Returns `Unavailable` if signing fails.
    pub fn mint_service_token(&self, typ: ClientType) -> Result<String, ApiError> {
        self.mint(typ, Uuid::nil(), None)
    }

    fn mint(&self, typ: ClientType, uid: UserId, nic: Option<String>) -> Result<String, ApiError> {
        let now = unix_now();
        let claims = Claims {
            iss: ClientType::Webapi,
            sub: "webgames".to_string(),
            iat: now,
            exp: now + self.expiration.as_secs(),
            jti: Uuid::new_v4(),
            typ,
            uid,
            nic,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
            .map_err(|e| ApiError::Unavailable(format!("cannot sign token: {e}")))
    }

    /// Validate the `Authorization` header and yield the verified claims.
    ///
    /// # Errors
    /// - `Unauthorized` when the header is missing or not `Bearer:`.
    /// - `Forbidden` when the token is invalid/expired, revoked, or its
    ///   principal kind is outside `allowed`.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        allowed: &[ClientType],
        client_ip: IpAddr,
    ) -> Result<Claims, ApiError> {
        let Some(bearer) = headers.get(hyper::header::AUTHORIZATION) else {
            warn!("Authorization header is missing (IP: {client_ip})");
            return Err(ApiError::Unauthorized("Authorization header required".to_string()));
        };
        let bearer = bearer
            .to_str()
            .map_err(|_| ApiError::Unauthorized("Bearer authorization type required".to_string()))?;
        let Some(token) = bearer.strip_prefix("Bearer:") else {
            warn!("Wrong authorization header type (IP: {client_ip})");
            return Err(ApiError::Unauthorized("Bearer authorization type required".to_string()));
        };

        let validation = Validation::new(Algorithm::HS256);
        let claims = decode::<Claims>(
            token.trim(),
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            warn!("Invalid token: {e} (IP: {client_ip})");
            ApiError::Forbidden("Invalid token".to_string())
        })?
        .claims;

        if self.kvs.is_token_revoked(claims.jti).await? {
            warn!("Token has been revoked (IP: {client_ip})");
            return Err(ApiError::Forbidden("Revoked token".to_string()));
        }

        if !allowed.contains(&claims.typ) {
            warn!(
                "Restricted access: \"{}\" not in {{{}}} (IP: {client_ip})",
                claims.typ,
                allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            );
            return Err(ApiError::Forbidden("Restricted access".to_string()));
        }

        Ok(claims)
    }

    /// Revoke the token behind a set of verified claims. The revocation entry
    /// carries the token's own expiry so pruning can discard it later.
    ///
    /// # Errors
    /// Propagates session-store errors.
    pub async fn revoke(&self, claims: &Claims) -> Result<(), ApiError> {
        self.kvs.revoke_token(claims.jti, claims.exp).await?;
        info!("Token revoked: {}", claims.jti);
        Ok(())
    }
}

/// Hash a password into a PHC string for storage.
///
/// # Errors
/// Returns `Unavailable` if the hasher fails (it should not).
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Unavailable(format!("cannot hash password: {e}")))
}

/// Check a password against a stored PHC string.
#[must_use]
pub fn verify_password(stored: &str, password: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
        .unwrap_or(false)
}

/// Resolve the client IP for logging and abuse tracking. Forwarding headers
/// are only trusted when the direct peer is a configured reverse proxy.
#[must_use]
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    if let Some(xri) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = xri.trim().parse() {
            return ip;
        }
    }
    peer
}
