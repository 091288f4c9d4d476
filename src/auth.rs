//! Credential store — flat-file users with salted password hashing
//!
//! One user per line, `username:hash:salt:role`, re-read on every
//! authentication attempt so edits take effect without a restart.
//! Malformed lines are skipped silently.

use anyhow::{Context, Result};
use sha2::{Digest, Sha512};
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Scheme tag selecting stretched SHA-512. The tag travels at the front of
/// the salt so other schemes can be introduced without breaking old files.
const SCHEME_SHA512: &str = "$6$";
const STRETCH_ROUNDS: u32 = 5000;
const SALT_LEN: usize = 16;
const SALT_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789./";

/// What an authenticated user is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Admin => "admin",
        }
    }

    fn from_field(field: &str) -> Option<Role> {
        match field.trim() {
            "0" => Some(Role::Viewer),
            "1" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// One parsed credential-file line.
#[derive(Debug, Clone)]
struct UserEntry {
    username: String,
    hash: String,
    salt: String,
    role: Role,
}

impl UserEntry {
    /// Parse `username:hash:salt:role`; returns `None` for anything else.
    fn parse(line: &str) -> Option<UserEntry> {
        let mut fields = line.split(':');
        let username = fields.next()?;
        let hash = fields.next()?;
        let salt = fields.next()?;
        let role = Role::from_field(fields.next()?)?;
        if fields.next().is_some() || username.is_empty() || hash.is_empty() || salt.is_empty() {
            return None;
        }
        Some(UserEntry {
            username: username.to_string(),
            hash: hash.to_string(),
            salt: salt.to_string(),
            role,
        })
    }
}

/// Flat-file user database. Holds only the path; every validation re-reads
/// the file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Open the store, verifying the file is readable now so a bad path
    /// fails at startup rather than on the first login.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::metadata(&path)
            .with_context(|| format!("credential file {} is not accessible", path.display()))?;
        Ok(Self { path })
    }

    /// Check a username/password pair against the file.
    ///
    /// Returns the role of the first matching entry. Hash comparison is
    /// length-independent so a near-miss costs the same as a full miss.
    pub fn validate(&self, username: &str, password: &str) -> Option<Role> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("credential file unreadable: {e}");
                return None;
            }
        };

        for line in contents.lines() {
            let Some(entry) = UserEntry::parse(line) else {
                continue;
            };
            if entry.username != username {
                continue;
            }
            let computed = generate_hash(password, &entry.salt);
            if constant_time_eq(computed.as_bytes(), entry.hash.as_bytes()) {
                return Some(entry.role);
            }
        }
        None
    }
}

/// Generate a fresh salt: scheme tag plus 16 characters of `[A-Za-z0-9./]`.
pub fn generate_salt() -> String {
    let mut salt = String::with_capacity(SCHEME_SHA512.len() + SALT_LEN);
    salt.push_str(SCHEME_SHA512);
    for byte in Uuid::new_v4().as_bytes() {
        salt.push(SALT_ALPHABET[(byte & 0x3f) as usize] as char);
    }
    salt
}

/// Hash a password with a tagged salt.
///
/// Only the SHA-512 scheme is currently defined; an unrecognized tag yields
/// an empty string, which can never equal a stored hash.
pub fn generate_hash(password: &str, salt: &str) -> String {
    if !salt.starts_with(SCHEME_SHA512) {
        return String::new();
    }

    let mut digest = Sha512::new()
        .chain_update(password.as_bytes())
        .chain_update(salt.as_bytes())
        .finalize();
    for _ in 1..STRETCH_ROUNDS {
        digest = Sha512::new()
            .chain_update(digest)
            .chain_update(password.as_bytes())
            .chain_update(salt.as_bytes())
            .finalize();
    }

    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Byte equality whose running time does not depend on where the inputs
/// differ or on either length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
