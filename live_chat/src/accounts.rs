use std::sync::Arc;

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use chat_protocol::{SigninRequest, SignupRequest};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult, StoreError};
use crate::model::{now_millis, UserIdentity, UserRecord};
use crate::store::UserStore;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{3,30}$").unwrap());
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

pub const MIN_PASSWORD_LEN: usize = 6;
pub const SEARCH_LIMIT: usize = 50;

/// Turns a presented credential into a verified identity. Used for bearer
/// tokens on HTTP requests and for socket handshakes alike.
pub trait Authenticator: Send + Sync {
    fn verify(&self, credential: &str) -> ChatResult<UserIdentity>;
}

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> ChatResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(pass.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ChatError::Internal(format!("hash: {}", e)))
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: usize,
}

/// Issue a JWT for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user: &UserRecord, valid_for: Duration) -> ChatResult<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp().max(0) as usize;
    let claims = Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| ChatError::Internal(format!("token: {}", e)))
}

/// Verify a JWT signature and expiry and return its claims.
pub fn verify_jwt(secret: &[u8], token: &str) -> ChatResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|_| ChatError::Unauthenticated)?;
    Ok(data.claims)
}

/// HS256 bearer tokens whose subject must still resolve to a stored user.
#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: Arc<[u8]>,
    valid_for: Duration,
    users: Arc<dyn UserStore>,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8], valid_for: Duration, users: Arc<dyn UserStore>) -> Self {
        Self {
            secret: Arc::from(secret),
            valid_for,
            users,
        }
    }

    pub fn issue(&self, user: &UserRecord) -> ChatResult<String> {
        issue_jwt(&self.secret, user, self.valid_for)
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, credential: &str) -> ChatResult<UserIdentity> {
        let claims = verify_jwt(&self.secret, credential)?;
        let id = Uuid::parse_str(&claims.sub).map_err(|_| ChatError::Unauthenticated)?;
        match self.users.find_user(&id) {
            Ok(user) => Ok(user.identity()),
            Err(StoreError::NotFound) => Err(ChatError::Unauthenticated),
            Err(e) => Err(e.into()),
        }
    }
}

/// Signup, signin and user lookup.
#[derive(Clone)]
pub struct Accounts {
    users: Arc<dyn UserStore>,
    tokens: JwtAuthenticator,
}

impl Accounts {
    pub fn new(users: Arc<dyn UserStore>, tokens: JwtAuthenticator) -> Self {
        Self { users, tokens }
    }

    pub fn authenticator(&self) -> &JwtAuthenticator {
        &self.tokens
    }

    pub fn signup(&self, req: &SignupRequest) -> ChatResult<UserRecord> {
        let username = req.username.trim();
        if !USERNAME_RE.is_match(username) {
            return Err(ChatError::invalid(
                "Username must be 3-30 characters of letters, numbers, and underscores",
            ));
        }
        let email = req
            .email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        if let Some(email) = &email {
            if !EMAIL_RE.is_match(email) {
                return Err(ChatError::invalid("Invalid email address"));
            }
        }
        if req.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ChatError::invalid("Password must be at least 6 characters"));
        }
        let user = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email,
            password_hash: hash_password(&req.password)?,
            created_at: now_millis(),
        };
        self.users.insert_user(&user)?;
        tracing::info!(user_id = %user.id, username = %user.username, "account created");
        Ok(user)
    }

    /// Returns a fresh token and the matching account.
    pub fn signin(&self, req: &SigninRequest) -> ChatResult<(String, UserRecord)> {
        let login = req.email.trim();
        if login.is_empty() {
            return Err(ChatError::invalid("Email is required"));
        }
        if req.password.is_empty() {
            return Err(ChatError::invalid("Password is required"));
        }
        let user = match self.users.find_user_by_login(login) {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(ChatError::Unauthenticated),
            Err(e) => return Err(e.into()),
        };
        if !verify_password(&req.password, &user.password_hash) {
            return Err(ChatError::Unauthenticated);
        }
        let token = self.tokens.issue(&user)?;
        Ok((token, user))
    }

    pub fn profile(&self, id: &Uuid) -> ChatResult<UserRecord> {
        Ok(self.users.find_user(id)?)
    }

    /// Other users whose username contains `query`, case-insensitively.
    pub fn search(&self, requester: &Uuid, query: Option<&str>) -> ChatResult<Vec<UserRecord>> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        Ok(self.users.search_users(requester, query, SEARCH_LIMIT)?)
    }
}
