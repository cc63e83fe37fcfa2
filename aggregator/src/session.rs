use crate::config::AdminConfig;
use crate::metrics_defs::SESSIONS_ACTIVE;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use shared::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TOKEN_BYTES: usize = 32;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("admin.password_sha256 must be 64 hex characters")]
    InvalidPasswordHash,
}

/// SHA-256 of the admin password. The plaintext is never kept.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash([u8; 32]);

impl PasswordHash {
    pub fn from_password(password: &str) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(password.as_bytes()));
        PasswordHash(digest)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SessionError> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(encoded.trim(), &mut digest)
            .map_err(|_| SessionError::InvalidPasswordHash)?;
        Ok(PasswordHash(digest))
    }

    /// Resolves the configured hash, falling back to the plaintext in the
    /// environment variable named by `password_env`. Returns `None` when
    /// neither is set, in which case every login fails.
    pub fn from_config(config: &AdminConfig) -> Result<Option<Self>, SessionError> {
        if let Some(encoded) = &config.password_sha256 {
            return Self::from_hex(encoded).map(Some);
        }

        match std::env::var(&config.password_env) {
            Ok(password) if !password.is_empty() => Ok(Some(Self::from_password(&password))),
            _ => {
                tracing::warn!(
                    env = %config.password_env,
                    "No admin password configured, admin login is disabled"
                );
                Ok(None)
            }
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn matches(&self, candidate: &str) -> bool {
        let digest = Sha256::digest(candidate.as_bytes());
        digest.as_slice().ct_eq(&self.0).into()
    }
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub token: String,
    pub expires_in: Duration,
}

/// Bearer tokens for the admin API with a sliding idle timeout.
pub struct SessionManager {
    password: Option<PasswordHash>,
    ttl: Duration,
    // token -> expiresAt
    sessions: Mutex<HashMap<String, Instant>>,
}

impl SessionManager {
    pub fn new(password: Option<PasswordHash>, ttl: Duration) -> Self {
        SessionManager {
            password,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn login(&self, password: &str) -> Result<Session, SessionError> {
        let Some(expected) = &self.password else {
            return Err(SessionError::Unauthorized);
        };
        if !expected.matches(password) {
            tracing::warn!("Rejected admin login");
            return Err(SessionError::Unauthorized);
        }

        let token = new_token();
        self.sessions
            .lock()
            .insert(token.clone(), Instant::now() + self.ttl);
        tracing::info!("Admin session created");

        Ok(Session {
            token,
            expires_in: self.ttl,
        })
    }

    /// Validates a token and slides its expiry forward. Returns the new expiry.
    pub fn authorize(&self, token: &str) -> Result<Instant, SessionError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        match sessions.get_mut(token) {
            Some(expires_at) if now <= *expires_at => {
                *expires_at = now + self.ttl;
                Ok(*expires_at)
            }
            Some(_) => {
                sessions.remove(token);
                Err(SessionError::Unauthorized)
            }
            None => Err(SessionError::Unauthorized),
        }
    }

    /// Revokes a token. Revoking an unknown token is a no-op.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Drops every expired session and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, expires_at| now <= *expires_at);
        let removed = before - sessions.len();

        gauge!(SESSIONS_ACTIVE).set(sessions.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired admin sessions");
                }
            }
        })
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn manager() -> SessionManager {
        SessionManager::new(Some(PasswordHash::from_password("hunter2")), TTL)
    }

    #[test]
    fn test_password_hash() {
        let hash = PasswordHash::from_password("hunter2");
        assert_eq!(PasswordHash::from_hex(&hash.to_hex()), Ok(hash.clone()));
        assert!(hash.matches("hunter2"));
        assert!(!hash.matches("hunter3"));
        assert!(!hash.matches(""));

        assert_eq!(
            PasswordHash::from_hex("abc"),
            Err(SessionError::InvalidPasswordHash)
        );
        assert_eq!(
            PasswordHash::from_hex(&"zz".repeat(32)),
            Err(SessionError::InvalidPasswordHash)
        );
    }

    #[test]
    fn test_from_config() {
        let hash = PasswordHash::from_password("secret");
        let config = AdminConfig {
            password_sha256: Some(hash.to_hex()),
            ..Default::default()
        };
        assert_eq!(PasswordHash::from_config(&config), Ok(Some(hash)));

        let config = AdminConfig {
            password_env: "SOURCEHUB_TEST_UNSET_PASSWORD_VAR".into(),
            ..Default::default()
        };
        assert_eq!(PasswordHash::from_config(&config), Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login() {
        let sessions = manager();
        assert_eq!(sessions.login("wrong"), Err(SessionError::Unauthorized));
        assert!(sessions.is_empty());

        let a = sessions.login("hunter2").unwrap();
        let b = sessions.login("hunter2").unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), TOKEN_BYTES * 2);
        assert_eq!(a.expires_in, TTL);
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_disabled_without_password() {
        let sessions = SessionManager::new(None, TTL);
        assert_eq!(sessions.login(""), Err(SessionError::Unauthorized));
        assert_eq!(sessions.login("hunter2"), Err(SessionError::Unauthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiry() {
        let sessions = manager();
        let token = sessions.login("hunter2").unwrap().token;

        let mut last = Instant::now();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(29 * 60)).await;
            let expires_at = sessions.authorize(&token).unwrap();
            assert!(expires_at > last);
            last = expires_at;
        }

        // Idle past the timeout
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(sessions.authorize(&token), Err(SessionError::Unauthorized));
        // The expired token was dropped on the failed check
        assert!(sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let sessions = manager();
        let token = sessions.login("hunter2").unwrap().token;

        tokio::time::advance(TTL).await;
        assert!(sessions.authorize(&token).is_ok());

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(sessions.authorize(&token).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout() {
        let sessions = manager();
        let old = sessions.login("hunter2").unwrap().token;

        assert!(sessions.logout(&old));
        assert!(!sessions.logout(&old));
        assert_eq!(sessions.authorize(&old), Err(SessionError::Unauthorized));

        let new = sessions.login("hunter2").unwrap().token;
        assert!(sessions.authorize(&new).is_ok());
        assert!(sessions.authorize(&old).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep() {
        let sessions = manager();
        let stale = sessions.login("hunter2").unwrap().token;
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let live = sessions.login("hunter2").unwrap().token;
        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        assert_eq!(sessions.sweep(), 1);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.authorize(&live).is_ok());
        assert!(sessions.authorize(&stale).is_err());
        assert_eq!(sessions.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task() {
        let sessions = Arc::new(manager());
        sessions.login("hunter2").unwrap();
        let handle = sessions.clone().spawn_sweeper(Duration::from_secs(5 * 60));

        // Past the TTL plus one sweep interval
        tokio::time::sleep(TTL + Duration::from_secs(6 * 60)).await;
        assert!(sessions.is_empty());
        handle.abort();
    }
}
