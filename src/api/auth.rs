// =============================================================================
// Auth collaborator
// =============================================================================
//
// Token minting and verification plus the register/login boundary. The rest
// of the system consumes exactly one capability from this module:
// `verify(token) -> Option<Principal>` (also exposed to the hub through the
// `TokenVerifier` trait). Passwords are bcrypt-hashed; tokens are JWTs
// signed with the configured secret.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use bcrypt::{hash, verify as bcrypt_verify, DEFAULT_COST};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::hub::TokenVerifier;
use crate::repo::{Repository, User};
use crate::types::{Principal, UserRole};

use super::error::ApiError;

const TOKEN_TTL_HOURS: i64 = 24;
/// Every new account starts with this much simulated cash.
pub const STARTING_CASH: f64 = 100_000.0;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    role: String,
    exp: usize,
}

pub struct AuthService {
    repo: Arc<Repository>,
    secret: String,
}

impl AuthService {
    pub fn new(repo: Arc<Repository>, secret: String) -> Self {
        Self { repo, secret }
    }

    // =========================================================================
    // Account lifecycle
    // =========================================================================

    pub fn register(&self, username: &str, password: &str) -> Result<(User, String), ApiError> {
        let username = username.trim();
        if username.len() < 3 || username.len() > 32 {
            return Err(ApiError::invalid("username must be 3-32 characters"));
        }
        if !username.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(ApiError::invalid(
                "username may contain letters, digits, '_' and '-' only",
            ));
        }
        if password.len() < 8 {
            return Err(ApiError::invalid("password must be at least 8 characters"));
        }
        if self.repo.get_user_by_username(username)?.is_some() {
            return Err(ApiError::invalid("username already taken"));
        }

        let password_hash = hash(password, DEFAULT_COST)
            .map_err(|e| ApiError::Internal(format!("hash failure: {e}")))?;
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash,
            cash: STARTING_CASH,
            starting_cash: STARTING_CASH,
            role: UserRole::Trader,
            created_at: Utc::now().to_rfc3339(),
        };
        self.repo.insert_user(&user)?;
        info!(username = %user.username, "user registered");

        let token = self.mint_token(&user)?;
        Ok((user, token))
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(User, String), ApiError> {
        let Some(user) = self.repo.get_user_by_username(username)? else {
            return Err(ApiError::Unauthorized("invalid credentials".into()));
        };
        let ok = bcrypt_verify(password, &user.password_hash)
            .map_err(|e| ApiError::Internal(format!("verify failure: {e}")))?;
        if !ok {
            warn!(username, "failed login attempt");
            return Err(ApiError::Unauthorized("invalid credentials".into()));
        }
        let token = self.mint_token(&user)?;
        debug!(username = %user.username, "login succeeded");
        Ok((user, token))
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    fn mint_token(&self, user: &User) -> Result<String, ApiError> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(TOKEN_TTL_HOURS))
            .map(|t| t.timestamp() as usize)
            .ok_or_else(|| ApiError::Internal("clock overflow".into()))?;
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            role: user.role.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ApiError::Internal(format!("token mint failure: {e}")))
    }

    /// The single capability the core consumes.
    pub fn verify(&self, token: &str) -> Option<Principal> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?;
        Some(Principal {
            user_id: decoded.claims.sub,
            username: decoded.claims.username,
            role: UserRole::parse(&decoded.claims.role),
        })
    }
}

impl TokenVerifier for AuthService {
    fn verify(&self, token: &str) -> Option<Principal> {
        AuthService::verify(self, token)
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Request extractor yielding the authenticated principal, or 401.
pub struct AuthUser(pub Principal);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                return Err(ApiError::Unauthorized(
                    "missing or malformed authorization header".into(),
                ))
            }
        };
        match state.auth.verify(token) {
            Some(principal) => Ok(AuthUser(principal)),
            None => Err(ApiError::Unauthorized("invalid or expired token".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;

    fn service() -> (AuthService, tempfile::TempDir) {
        let (repo, dir) = test_repo();
        (AuthService::new(Arc::new(repo), "test-secret".into()), dir)
    }

    #[test]
    fn register_then_login_roundtrip() {
        let (auth, _d) = service();
        let (user, token) = auth.register("alice", "hunter2hunter2").unwrap();
        assert_eq!(user.cash, STARTING_CASH);
        assert!(auth.verify(&token).is_some());

        let (again, token2) = auth.login("alice", "hunter2hunter2").unwrap();
        assert_eq!(again.id, user.id);
        let principal = auth.verify(&token2).unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.user_id, user.id);
    }

    #[test]
    fn wrong_password_rejected() {
        let (auth, _d) = service();
        auth.register("alice", "hunter2hunter2").unwrap();
        assert!(matches!(
            auth.login("alice", "wrong-password"),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn duplicate_usernames_rejected_case_insensitively() {
        let (auth, _d) = service();
        auth.register("alice", "hunter2hunter2").unwrap();
        assert!(matches!(
            auth.register("ALICE", "hunter2hunter2"),
            Err(ApiError::Invalid(_))
        ));
    }

    #[test]
    fn weak_inputs_rejected() {
        let (auth, _d) = service();
        assert!(auth.register("al", "hunter2hunter2").is_err());
        assert!(auth.register("alice", "short").is_err());
        assert!(auth.register("bad name!", "hunter2hunter2").is_err());
    }

    #[test]
    fn garbage_tokens_verify_to_none() {
        let (auth, _d) = service();
        assert!(auth.verify("not-a-token").is_none());
        assert!(auth.verify("").is_none());
    }

    #[test]
    fn tokens_from_another_secret_fail() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let a = AuthService::new(repo.clone(), "secret-a".into());
        let b = AuthService::new(repo, "secret-b".into());
        let (_, token) = a.register("alice", "hunter2hunter2").unwrap();
        assert!(b.verify(&token).is_none());
    }
}
