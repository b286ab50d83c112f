//! Presence storage
//!
//! `PresenceStore` is the narrow interface the reaper and the presence
//! endpoint share: liveness upserts, stale queries by cutoff, single-entity
//! deletes, and an explicit commit. `SqliteStore` is the bundled
//! implementation, either on disk or in memory.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A connected (or recently connected) client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    /// Room the client joined, if any
    pub room: Option<String>,
    /// Last liveness signal
    pub seen: DateTime<Utc>,
}

/// A room clients gather in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    /// Last activity by any member
    pub active: DateTime<Utc>,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Mutex lock was poisoned (a thread panicked while holding the lock)
    #[error("lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,

    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Storage used by the presence endpoint and the reaper
///
/// Deletes are staged until `commit`; deleting an entity that no longer
/// exists returns `Ok(false)`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert a client or replace its room/seen
    async fn upsert_client(&self, client: &Client) -> Result<(), StoreError>;

    /// Record a liveness signal. `seen` never moves backwards.
    async fn touch_client(&self, id: &str, seen: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Insert a room or replace its activity timestamp
    async fn upsert_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Record room activity. `active` never moves backwards.
    async fn touch_room(&self, id: &str, active: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Clients whose `seen` is strictly older than `cutoff`
    async fn clients_seen_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Client>, StoreError>;

    /// Rooms whose `active` is strictly older than `cutoff`
    async fn rooms_active_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Room>, StoreError>;

    async fn delete_client(&self, id: &str) -> Result<bool, StoreError>;

    async fn delete_room(&self, id: &str) -> Result<bool, StoreError>;

    /// Make staged deletions durable
    async fn commit(&self) -> Result<(), StoreError>;

    async fn client_count(&self) -> Result<usize, StoreError>;

    async fn room_count(&self) -> Result<usize, StoreError>;
}

/// SQLite storage backend
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                room TEXT,
                seen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                active INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clients_seen ON clients(seen);
            CREATE INDEX IF NOT EXISTS idx_rooms_active ON rooms(active);
            "#,
        )?;

        info!("Storage schema initialized");
        Ok(())
    }

    /// Open a transaction for staged deletes unless one is already open
    fn begin_if_needed(conn: &Connection) -> Result<(), StoreError> {
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Roll back the open transaction if `result` failed
    fn rollback_on_error<T>(conn: &Connection, result: rusqlite::Result<T>) -> Result<T, StoreError> {
        result.map_err(|e| {
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "Failed to roll back staged deletes");
                }
            }
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl PresenceStore for SqliteStore {
    async fn upsert_client(&self, client: &Client) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO clients (id, room, seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET room = excluded.room, seen = excluded.seen",
            params![client.id, client.room, to_millis(client.seen)],
        )?;
        debug!("Client stored: {}", client.id);
        Ok(())
    }

    async fn touch_client(&self, id: &str, seen: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE clients SET seen = MAX(seen, ?1) WHERE id = ?2",
            params![to_millis(seen), id],
        )?;
        Ok(updated > 0)
    }

    async fn upsert_room(&self, room: &Room) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rooms (id, active) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET active = excluded.active",
            params![room.id, to_millis(room.active)],
        )?;
        debug!("Room stored: {}", room.id);
        Ok(())
    }

    async fn touch_room(&self, id: &str, active: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE rooms SET active = MAX(active, ?1) WHERE id = ?2",
            params![to_millis(active), id],
        )?;
        Ok(updated > 0)
    }

    async fn clients_seen_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Client>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, room, seen FROM clients WHERE seen < ?1")?;

        let rows = stmt
            .query_map(params![to_millis(cutoff)], |row| {
                let id: String = row.get(0)?;
                let room: Option<String> = row.get(1)?;
                let seen: i64 = row.get(2)?;
                Ok((id, room, seen))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, room, seen)| {
                Ok(Client {
                    id,
                    room,
                    seen: from_millis(seen)?,
                })
            })
            .collect()
    }

    async fn rooms_active_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Room>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, active FROM rooms WHERE active < ?1")?;

        let rows = stmt
            .query_map(params![to_millis(cutoff)], |row| {
                let id: String = row.get(0)?;
                let active: i64 = row.get(1)?;
                Ok((id, active))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, active)| {
                Ok(Room {
                    id,
                    active: from_millis(active)?,
                })
            })
            .collect()
    }

    async fn delete_client(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Self::begin_if_needed(&conn)?;
        let deleted = Self::rollback_on_error(
            &conn,
            conn.execute("DELETE FROM clients WHERE id = ?1", params![id]),
        )?;
        Ok(deleted > 0)
    }

    async fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Self::begin_if_needed(&conn)?;
        let deleted = Self::rollback_on_error(
            &conn,
            conn.execute("DELETE FROM rooms WHERE id = ?1", params![id]),
        )?;
        Ok(deleted > 0)
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        if !conn.is_autocommit() {
            Self::rollback_on_error(&conn, conn.execute_batch("COMMIT"))?;
        }
        Ok(())
    }

    async fn client_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn room_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl SqliteStore {
    /// Look up a single client
    pub fn get_client(&self, id: &str) -> Result<Option<Client>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, room, seen FROM clients WHERE id = ?1",
                params![id],
                |row| {
                    let id: String = row.get(0)?;
                    let room: Option<String> = row.get(1)?;
                    let seen: i64 = row.get(2)?;
                    Ok((id, room, seen))
                },
            )
            .optional()?;

        row.map(|(id, room, seen)| {
            Ok(Client {
                id,
                room,
                seen: from_millis(seen)?,
            })
        })
        .transpose()
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ms))
}
