//! SQLite-backed local metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  Two tables act as independent namespaces:
//! `users` (name -> secret) and `objects` (oid -> descriptor JSON).
//! Every operation runs under the connection mutex, and registration
//! runs in its own transaction.
//!
//! Requests authenticate with HTTP Basic credentials checked against
//! `users`; any authenticated user may read and write every repository.

use std::sync::{Mutex, MutexGuard};

use base64::Engine;
use rusqlite::{params, Connection, OptionalExtension};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::store::{MetaStore, ObjectDescriptor, RequestContext, StoreError, StoreFuture};

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Metadata store backed by a single SQLite database file.
pub struct LocalMetaStore {
    conn: Mutex<Connection>,
}

impl LocalMetaStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS users (
                name   TEXT PRIMARY KEY,
                secret TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
                oid        TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata store mutex poisoned"))
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// Create or replace a user's secret.
    pub fn add_user(&self, name: &str, secret: &str) -> anyhow::Result<()> {
        if name.is_empty() || secret.is_empty() {
            anyhow::bail!("user name and secret must be non-empty");
        }
        self.conn()?.execute(
            "INSERT OR REPLACE INTO users (name, secret) VALUES (?1, ?2)",
            params![name, secret],
        )?;
        Ok(())
    }

    /// Remove a user. Returns whether the user existed.
    pub fn delete_user(&self, name: &str) -> anyhow::Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM users WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    /// All user names, sorted.
    pub fn users(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM users ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Check an `Authorization: Basic` header, returning the user name.
    fn authenticate(&self, authorization: Option<&str>) -> Result<String, StoreError> {
        let (user, secret) = authorization
            .and_then(parse_basic)
            .ok_or(StoreError::Unauthorized)?;

        let stored: Option<String> = self
            .conn()?
            .query_row(
                "SELECT secret FROM users WHERE name = ?1",
                params![user],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(stored)
                if !stored.is_empty() && bool::from(stored.as_bytes().ct_eq(secret.as_bytes())) =>
            {
                Ok(user)
            }
            _ => {
                debug!(user = %user, "local authentication failed");
                Err(StoreError::Unauthorized)
            }
        }
    }

    // ── Objects ─────────────────────────────────────────────────────

    fn lookup(&self, oid: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT descriptor FROM objects WHERE oid = ?1",
                params![oid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn get_sync(&self, ctx: &RequestContext) -> Result<ObjectDescriptor, StoreError> {
        self.authenticate(ctx.authorization.as_deref())?;
        let mut desc = self.lookup(&ctx.oid)?.ok_or(StoreError::NotFound)?;
        desc.writeable = true;
        Ok(desc)
    }

    fn put_sync(&self, ctx: &RequestContext) -> Result<ObjectDescriptor, StoreError> {
        self.authenticate(ctx.authorization.as_deref())?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT descriptor FROM objects WHERE oid = ?1",
                params![ctx.oid],
                |row| row.get(0),
            )
            .optional()?;

        let desc = match stored {
            Some(json) => {
                let mut desc: ObjectDescriptor = serde_json::from_str(&json)?;
                if desc.size != ctx.size {
                    debug!(oid = %ctx.oid, stored = desc.size, requested = ctx.size, "size mismatch on registration");
                    return Err(StoreError::Inconsistent);
                }
                desc.existing = true;
                desc
            }
            None => {
                let desc = ctx.descriptor();
                tx.execute(
                    "INSERT INTO objects (oid, descriptor) VALUES (?1, ?2)",
                    params![desc.oid, serde_json::to_string(&desc)?],
                )?;
                desc
            }
        };
        tx.commit()?;

        Ok(ObjectDescriptor {
            writeable: true,
            ..desc
        })
    }

    fn verify_sync(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        self.authenticate(ctx.authorization.as_deref())?;
        self.lookup(&ctx.oid)?.ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

impl MetaStore for LocalMetaStore {
    fn get<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor> {
        Box::pin(async move { self.get_sync(ctx) })
    }

    fn put<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ObjectDescriptor> {
        Box::pin(async move { self.put_sync(ctx) })
    }

    fn verify<'a>(&'a self, ctx: &'a RequestContext) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.verify_sync(ctx) })
    }
}

/// Split `Basic <base64(user:secret)>` into its parts.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, secret) = decoded.split_once(':')?;
    Some((user.to_string(), secret.to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────
