//! Authentication (§4.3): JWT minting/verification, API key issuance/validation, password
//! hashing. Grounded on `api/auth.py`'s constants and `PermissionChecker`'s scope model.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use subtle::ConstantTimeEq;

pub const ACCESS_TOKEN_EXPIRE_MINUTES: i64 = 60;
const API_KEY_ENTROPY_BYTES: usize = 32;
const KEY_PREFIX_LEN: usize = 16;

/// Closed set of failure reasons a caller-facing handler must map onto the uniform error
/// envelope (§7). Re-architected as a result type rather than exceptions, per §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    InvalidToken,
    DisabledUser,
}

/// JWT claims (§6): `{sub, scopes, auth_type, exp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub scopes: Vec<String>,
    pub auth_type: String,
    pub exp: i64,
}

/// Decoded, verified token data handed to downstream authorization checks.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub username: String,
    pub scopes: Vec<String>,
    pub auth_type: String,
}

/// A registered API key's persisted metadata (§3 APIKey). The raw secret never appears here;
/// only its SHA-256 hash does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub key_hash: String,
    pub owner_user_id: String,
    pub scopes: Vec<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
    pub name: Option<String>,
    pub revoked: bool,
}

/// A user account record. Password is stored only as an argon2 hash string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub scopes: Vec<String>,
    pub disabled: bool,
}

/// Process-wide signer plus in-memory user/key stores. Reads (token/key validation) are hot;
/// writes (key issuance/revocation, user changes) are rare — a read/write lock per §5.
pub struct AuthStorage {
    secret: Vec<u8>,
    users: RwLock<HashMap<String, User>>,
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    hasher: Argon2<'static>,
}

impl AuthStorage {
    /// `secret`: an env-provided signing key, or `None` to mint a fresh high-entropy value.
    /// In the latter case, per §9, previously issued tokens do not survive process restart —
    /// an accepted deliberate policy, not a bug.
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        let secret = secret.unwrap_or_else(|| {
            let mut buf = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut buf);
            buf.to_vec()
        });
        Self {
            secret,
            users: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            hasher: Argon2::default(),
        }
    }

    pub fn add_user(&self, user: User) {
        self.users.write().unwrap().insert(user.username.clone(), user);
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.users.read().unwrap().get(username).cloned()
    }

    pub fn hash_password(&self, password: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut rand::thread_rng());
        let hash = self
            .hasher
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.hasher.verify_password(password.as_bytes(), &parsed).is_ok()
    }

    /// `create_access_token` (§4.3): mint a signed HS256 JWT with a default 60-minute TTL.
    pub fn create_access_token(&self, subject: &str, scopes: &[String], auth_type: &str) -> anyhow::Result<String> {
        self.create_access_token_with_ttl(subject, scopes, auth_type, ACCESS_TOKEN_EXPIRE_MINUTES)
    }

    pub fn create_access_token_with_ttl(
        &self,
        subject: &str,
        scopes: &[String],
        auth_type: &str,
        ttl_minutes: i64,
    ) -> anyhow::Result<String> {
        let exp = (Utc::now() + ChronoDuration::minutes(ttl_minutes)).timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            scopes: scopes.to_vec(),
            auth_type: auth_type.to_string(),
            exp,
        };
        let token = jsonwebtoken::encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )?;
        Ok(token)
    }

    /// Decode and verify signature + expiry. Any failure collapses to `auth_invalid_token`.
    pub fn verify_access_token(&self, token: &str) -> Result<TokenData, AuthError> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        let decoded = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|_| AuthError::InvalidToken)?;
        Ok(TokenData {
            username: decoded.claims.sub,
            scopes: decoded.claims.scopes,
            auth_type: decoded.claims.auth_type,
        })
    }

    /// Issue a new API key (§4.3). Returns `(raw_key, record)`; the raw value is never
    /// persisted and is returned exactly once.
    pub fn issue_api_key(&self, owner_user_id: &str, scopes: Vec<String>, name: Option<String>) -> (String, ApiKeyRecord) {
        let mut buf = [0u8; API_KEY_ENTROPY_BYTES];
        rand::thread_rng().fill_bytes(&mut buf);
        let raw = base64_url_no_pad(&buf);
        let key_hash = sha256_hex(raw.as_bytes());
        let key_id = raw.chars().take(KEY_PREFIX_LEN).collect::<String>();
        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            key_hash,
            owner_user_id: owner_user_id.to_string(),
            scopes,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
            name,
            revoked: false,
        };
        self.keys.write().unwrap().insert(record.key_hash.clone(), record.clone());
        (raw, record)
    }

    /// Validate a presented raw API key: hash it, look up by hash (never by prefix), check
    /// expiry and revocation, update `last_used_at`, and return effective scopes.
    pub fn validate_api_key(&self, raw_key: &str) -> Result<Vec<String>, AuthError> {
        let presented_hash = sha256_hex(raw_key.as_bytes());
        let mut keys = self.keys.write().unwrap();
        let record = keys
            .values_mut()
            .find(|r| constant_time_eq(r.key_hash.as_bytes(), presented_hash.as_bytes()))
            .ok_or(AuthError::InvalidToken)?;
        if record.revoked {
            return Err(AuthError::InvalidToken);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= Utc::now() {
                return Err(AuthError::InvalidToken);
            }
        }
        record.last_used_at = Some(Utc::now());
        Ok(record.scopes.clone())
    }

    pub fn revoke_api_key(&self, key_id: &str) -> bool {
        let mut keys = self.keys.write().unwrap();
        if let Some(record) = keys.values_mut().find(|r| r.key_id == key_id) {
            record.revoked = true;
            true
        } else {
            false
        }
    }

    pub fn list_api_keys(&self, owner_user_id: &str) -> Vec<ApiKeyRecord> {
        self.keys
            .read()
            .unwrap()
            .values()
            .filter(|r| r.owner_user_id == owner_user_id)
            .cloned()
            .collect()
    }
}

/// Request authentication precedence (§4.3): bearer token wins over API key; absent if
/// neither header is present.
pub enum Credential<'a> {
    Bearer(&'a str),
    ApiKey(&'a str),
    None,
}

pub fn select_credential<'a>(bearer: Option<&'a str>, api_key: Option<&'a str>) -> Credential<'a> {
    match (bearer, api_key) {
        (Some(token), _) => Credential::Bearer(token),
        (None, Some(key)) => Credential::ApiKey(key),
        (None, None) => Credential::None,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

fn base64_url_no_pad(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_round_trips_subject_and_scopes() {
        let storage = AuthStorage::new(Some(b"test-secret".to_vec()));
        let scopes = vec!["read".to_string(), "chat".to_string()];
        let token = storage.create_access_token("alice", &scopes, "password").unwrap();
        let data = storage.verify_access_token(&token).unwrap();
        assert_eq!(data.username, "alice");
        assert_eq!(data.scopes, scopes);
        assert_eq!(data.auth_type, "password");
    }

    #[test]
    fn tampered_token_fails_verification() {
        let storage = AuthStorage::new(Some(b"test-secret".to_vec()));
        let token = storage
            .create_access_token("alice", &["read".to_string()], "password")
            .unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(storage.verify_access_token(&tampered), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn expired_token_fails_verification() {
        let storage = AuthStorage::new(Some(b"test-secret".to_vec()));
        let token = storage
            .create_access_token_with_ttl("alice", &["read".to_string()], "password", -1)
            .unwrap();
        assert!(matches!(storage.verify_access_token(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn api_key_validates_once_then_fails_after_revocation() {
        let storage = AuthStorage::new(Some(b"test-secret".to_vec()));
        let (raw, record) = storage.issue_api_key("alice", vec!["read".to_string()], None);
        assert!(storage.validate_api_key(&raw).is_ok());
        assert!(storage.revoke_api_key(&record.key_id));
        assert!(matches!(storage.validate_api_key(&raw), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn password_hash_round_trips() {
        let storage = AuthStorage::new(None);
        let hash = storage.hash_password("correct horse battery staple").unwrap();
        assert!(storage.verify_password("correct horse battery staple", &hash));
        assert!(!storage.verify_password("wrong", &hash));
    }

    #[test]
    fn bearer_token_wins_over_api_key() {
        match select_credential(Some("tok"), Some("key")) {
            Credential::Bearer(t) => assert_eq!(t, "tok"),
            _ => panic!("expected bearer credential to take precedence"),
        }
    }
}
