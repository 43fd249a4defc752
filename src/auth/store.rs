//! SQLite-backed credential store: principals with hashed credentials,
//! optional second factors, bearer session tokens, and the audit log.
//!
//! Plaintext credentials exist only in the enroll return value; the store
//! keeps bcrypt verifiers, TOTP shared secrets, and single-use backup
//! codes. All sqlite work runs on the blocking pool; one connection is
//! opened per operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Semaphore;

use super::totp;
use crate::{GatewayError, Result};

pub const CREDENTIAL_PREFIX: &str = "bdrk_";
pub const SESSION_PREFIX: &str = "bdrk_sess_";

/// Credential verification is deliberately slow (bcrypt) and scans every
/// active record; the semaphore bounds concurrent scans so a flood of bad
/// credentials cannot amplify into a denial of service.
const DEFAULT_VERIFY_SLOTS: usize = 4;

#[derive(Debug, Clone)]
pub struct Principal {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub permissions: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub token: String,
    pub principal_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_used_at: Option<i64>,
    pub ip_address: String,
    pub user_agent: String,
    pub is_active: bool,
}

#[derive(Clone)]
pub struct TwoFactorEnrollment {
    pub secret: String,
    pub backup_codes: Vec<String>,
    pub provisioning_uri: String,
}

impl std::fmt::Debug for TwoFactorEnrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorEnrollment")
            .field("secret", &"<redacted>")
            .field("backup_codes", &self.backup_codes.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    path: PathBuf,
    verify_slots: Arc<Semaphore>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            verify_slots: Arc::new(Semaphore::new(DEFAULT_VERIFY_SLOTS)),
        }
    }

    pub fn with_verify_slots(mut self, slots: usize) -> Self {
        self.verify_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)
        })
        .await
    }

    /// Mints a credential and returns the plaintext exactly once.
    pub async fn enroll(
        &self,
        name: impl Into<String>,
        email: impl Into<String>,
        description: impl Into<String>,
        lifetime: Option<Duration>,
    ) -> Result<String> {
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let plaintext = format!("{CREDENTIAL_PREFIX}{}", hex_lower(&key_bytes));

        let hash = bcrypt::hash(&plaintext, bcrypt::DEFAULT_COST)
            .map_err(|err| GatewayError::Storage(format!("failed to hash credential: {err}")))?;

        let path = self.path.clone();
        let name = name.into();
        let email = email.into();
        let description = description.into();
        let expires_at = lifetime.map(|d| now_epoch() + d.as_secs() as i64);

        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO principals (key_hash, name, email, description, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![hash, name, email, description, now_epoch(), expires_at],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;

        Ok(plaintext)
    }

    /// Scans active credentials for a bcrypt match. The scan order is
    /// insertion order; the verifier itself is constant-time with respect
    /// to the stored hash.
    pub async fn verify(&self, plaintext: &str) -> Result<Principal> {
        let _slot = self
            .verify_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Internal("verify pool closed".to_string()))?;

        let path = self.path.clone();
        let plaintext = plaintext.to_string();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;

            let mut matched: Option<Principal> = None;
            {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, key_hash, name, email, description, is_active,
                                created_at, last_used_at, expires_at, permissions
                         FROM principals WHERE is_active = 1 ORDER BY id",
                    )
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(1)?, principal_from_row(row)?))
                    })
                    .map_err(storage_err)?;

                for row in rows {
                    let (hash, principal) = row.map_err(storage_err)?;
                    if bcrypt::verify(&plaintext, &hash).unwrap_or(false) {
                        matched = Some(principal);
                        break;
                    }
                }
            }

            let Some(principal) = matched else {
                return Err(GatewayError::UnknownCredential);
            };
            if let Some(expires_at) = principal.expires_at {
                if now_epoch() >= expires_at {
                    return Err(GatewayError::CredentialExpired);
                }
            }
            conn.execute(
                "UPDATE principals SET last_used_at = ?1 WHERE id = ?2",
                rusqlite::params![now_epoch(), principal.id],
            )
            .map_err(storage_err)?;
            Ok(principal)
        })
        .await
    }

    pub async fn deactivate(&self, principal_id: i64) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute(
                "UPDATE principals SET is_active = 0 WHERE id = ?1",
                rusqlite::params![principal_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn principal(&self, principal_id: i64) -> Result<Option<Principal>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT id, key_hash, name, email, description, is_active,
                        created_at, last_used_at, expires_at, permissions
                 FROM principals WHERE id = ?1",
                rusqlite::params![principal_id],
                principal_from_row,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    pub async fn list_principals(&self) -> Result<Vec<Principal>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, key_hash, name, email, description, is_active,
                            created_at, last_used_at, expires_at, permissions
                     FROM principals ORDER BY created_at DESC, id DESC",
                )
                .map_err(storage_err)?;
            let rows = stmt.query_map([], principal_from_row).map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage_err)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn enroll_two_factor(
        &self,
        principal_id: i64,
        account: &str,
        issuer: &str,
    ) -> Result<TwoFactorEnrollment> {
        let secret = totp::generate_secret();
        let backup_codes = totp::generate_backup_codes();
        let provisioning_uri = totp::provisioning_uri(&secret, account, issuer);

        let path = self.path.clone();
        let stored_secret = secret.clone();
        let stored_codes = backup_codes.join(",");
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO second_factors (principal_id, totp_secret, backup_codes, is_enabled, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(principal_id) DO UPDATE SET
                     totp_secret = excluded.totp_secret,
                     backup_codes = excluded.backup_codes,
                     is_enabled = 1",
                rusqlite::params![principal_id, stored_secret, stored_codes, now_epoch()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;

        Ok(TwoFactorEnrollment {
            secret,
            backup_codes,
            provisioning_uri,
        })
    }

    /// TOTP first, then backup codes; a backup code that matches is
    /// removed in the same transaction and never validates again.
    pub async fn verify_two_factor(&self, principal_id: i64, code: &str) -> Result<()> {
        let path = self.path.clone();
        let code = code.trim().to_string();
        run_blocking(move || {
            let mut conn = open_connection(&path)?;
            init_schema(&conn)?;
            let tx = conn.transaction().map_err(storage_err)?;

            let record: Option<(String, String, bool)> = tx
                .query_row(
                    "SELECT totp_secret, backup_codes, is_enabled
                     FROM second_factors WHERE principal_id = ?1",
                    rusqlite::params![principal_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(storage_err)?;

            let Some((secret, backup_codes, is_enabled)) = record else {
                return Err(GatewayError::TwoFactorDisabled);
            };
            if !is_enabled {
                return Err(GatewayError::TwoFactorDisabled);
            }

            if totp::validate(&secret, &code, now_epoch() as u64)? {
                return Ok(());
            }

            let mut remaining: Vec<&str> = backup_codes
                .split(',')
                .filter(|c| !c.is_empty())
                .collect();
            let before = remaining.len();
            remaining.retain(|candidate| *candidate != code);
            if remaining.len() == before {
                return Err(GatewayError::InvalidTwoFactor);
            }

            tx.execute(
                "UPDATE second_factors SET backup_codes = ?1 WHERE principal_id = ?2",
                rusqlite::params![remaining.join(","), principal_id],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn two_factor_enabled(&self, principal_id: i64) -> Result<bool> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let enabled: Option<bool> = conn
                .query_row(
                    "SELECT is_enabled FROM second_factors WHERE principal_id = ?1",
                    rusqlite::params![principal_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(enabled.unwrap_or(false))
        })
        .await
    }

    pub async fn disable_two_factor(&self, principal_id: i64) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            conn.execute(
                "UPDATE second_factors SET is_enabled = 0 WHERE principal_id = ?1",
                rusqlite::params![principal_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn remaining_backup_codes(&self, principal_id: i64) -> Result<Vec<String>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let codes: Option<String> = conn
                .query_row(
                    "SELECT backup_codes FROM second_factors WHERE principal_id = ?1",
                    rusqlite::params![principal_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(codes
                .unwrap_or_default()
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect())
        })
        .await
    }

    pub async fn mint_session(
        &self,
        principal_id: i64,
        lifetime: Duration,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<String> {
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = format!("{SESSION_PREFIX}{}", URL_SAFE.encode(token_bytes));

        let path = self.path.clone();
        let stored_token = token.clone();
        let ip_address = ip_address.to_string();
        let user_agent = user_agent.to_string();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let now = now_epoch();
            conn.execute(
                "INSERT INTO sessions (token, principal_id, created_at, expires_at, ip_address, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    stored_token,
                    principal_id,
                    now,
                    now + lifetime.as_secs() as i64,
                    ip_address,
                    user_agent
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await?;

        Ok(token)
    }

    pub async fn verify_session(&self, token: &str) -> Result<(Session, i64)> {
        let path = self.path.clone();
        let token = token.to_string();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;

            let session: Option<Session> = conn
                .query_row(
                    "SELECT id, token, principal_id, created_at, expires_at,
                            last_used_at, ip_address, user_agent, is_active
                     FROM sessions WHERE token = ?1 AND is_active = 1",
                    rusqlite::params![token],
                    session_from_row,
                )
                .optional()
                .map_err(storage_err)?;

            let Some(mut session) = session else {
                return Err(GatewayError::UnknownSession);
            };

            let now = now_epoch();
            if now >= session.expires_at {
                return Err(GatewayError::SessionExpired);
            }

            conn.execute(
                "UPDATE sessions SET last_used_at = ?1 WHERE id = ?2",
                rusqlite::params![now, session.id],
            )
            .map_err(storage_err)?;
            session.last_used_at = Some(now);

            let principal_id = session.principal_id;
            Ok((session, principal_id))
        })
        .await
    }

    pub async fn revoke_session(&self, token: &str) -> Result<()> {
        let path = self.path.clone();
        let token = token.to_string();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE token = ?1",
                rusqlite::params![token],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn revoke_all_sessions(&self, principal_id: i64) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE principal_id = ?1",
                rusqlite::params![principal_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn list_sessions(&self, principal_id: i64) -> Result<Vec<Session>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, token, principal_id, created_at, expires_at,
                            last_used_at, ip_address, user_agent, is_active
                     FROM sessions
                     WHERE principal_id = ?1 AND is_active = 1 AND expires_at > ?2
                     ORDER BY created_at DESC, id DESC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![principal_id, now_epoch()], session_from_row)
                .map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(storage_err)?);
            }
            Ok(out)
        })
        .await
    }

    /// Physically deletes sessions past expires-at + grace. Expired rows
    /// are already unusable; this only bounds table growth.
    pub async fn sweep_sessions(&self, grace: Duration) -> Result<usize> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let cutoff = now_epoch() - grace.as_secs() as i64;
            let deleted = conn
                .execute(
                    "DELETE FROM sessions WHERE expires_at <= ?1",
                    rusqlite::params![cutoff],
                )
                .map_err(storage_err)?;
            Ok(deleted)
        })
        .await
    }

    pub async fn record_audit(
        &self,
        principal_id: Option<i64>,
        action: &str,
        fingerprint: &str,
        ip_address: &str,
        user_agent: &str,
        path_hit: &str,
        status: u16,
    ) -> Result<()> {
        let path = self.path.clone();
        let action = action.to_string();
        let fingerprint = fingerprint.to_string();
        let ip_address = ip_address.to_string();
        let user_agent = user_agent.to_string();
        let path_hit = path_hit.to_string();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO audit_log (principal_id, action, fingerprint, ip_address, user_agent, request_path, status_code, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    principal_id,
                    action,
                    fingerprint,
                    ip_address,
                    user_agent,
                    path_hit,
                    status,
                    now_epoch()
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}

fn principal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Principal> {
    Ok(Principal {
        id: row.get(0)?,
        name: row.get(2)?,
        email: row.get(3)?,
        description: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
        expires_at: row.get(8)?,
        permissions: row.get(9)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        token: row.get(1)?,
        principal_id: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        last_used_at: row.get(5)?,
        ip_address: row.get(6)?,
        user_agent: row.get(7)?,
        is_active: row.get(8)?,
    })
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(storage_err)?;
    conn.pragma_update(None, "busy_timeout", 5_000)
        .map_err(storage_err)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(storage_err)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS principals (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             key_hash TEXT NOT NULL UNIQUE,
             name TEXT NOT NULL,
             email TEXT DEFAULT '',
             description TEXT DEFAULT '',
             is_active BOOLEAN DEFAULT 1,
             created_at INTEGER NOT NULL,
             last_used_at INTEGER,
             expires_at INTEGER,
             permissions TEXT DEFAULT '[]'
         );
         CREATE INDEX IF NOT EXISTS idx_principals_active ON principals(is_active);

         CREATE TABLE IF NOT EXISTS second_factors (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             principal_id INTEGER NOT NULL UNIQUE,
             totp_secret TEXT NOT NULL,
             backup_codes TEXT DEFAULT '',
             is_enabled BOOLEAN DEFAULT 0,
             created_at INTEGER NOT NULL,
             FOREIGN KEY (principal_id) REFERENCES principals(id) ON DELETE CASCADE
         );

         CREATE TABLE IF NOT EXISTS sessions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             token TEXT NOT NULL UNIQUE,
             principal_id INTEGER NOT NULL,
             created_at INTEGER NOT NULL,
             expires_at INTEGER NOT NULL,
             last_used_at INTEGER,
             ip_address TEXT DEFAULT '',
             user_agent TEXT DEFAULT '',
             is_active BOOLEAN DEFAULT 1,
             FOREIGN KEY (principal_id) REFERENCES principals(id) ON DELETE CASCADE
         );
         CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token);
         CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(is_active, expires_at);

         CREATE TABLE IF NOT EXISTS audit_log (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             principal_id INTEGER,
             action TEXT NOT NULL,
             fingerprint TEXT DEFAULT '',
             ip_address TEXT DEFAULT '',
             user_agent TEXT DEFAULT '',
             request_path TEXT DEFAULT '',
             status_code INTEGER DEFAULT 0,
             created_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_audit_principal ON audit_log(principal_id);
         CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);",
    )
    .map_err(storage_err)
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| GatewayError::Storage(format!("blocking task failed: {err}")))?
}

fn storage_err(err: rusqlite::Error) -> GatewayError {
    GatewayError::Storage(err.to_string())
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
