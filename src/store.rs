//! Persistent profile store
//!
//! Owns CRUD and reactive watch over profile and server records on SQLite.
//! Every multi-row mutation runs inside a single transaction: a profile and
//! its servers are inserted in one commit, a sync result (metadata update +
//! wholesale server replacement) lands in one commit, and the at-most-one
//! active-profile invariant is enforced here rather than by callers.
//!
//! Watchers receive a fresh snapshot after each committed mutation, so a
//! concurrent reader never observes a profile mid-replace.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ParsedServer, Profile, ProfileKind, Server, SubscriptionInfo};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    id                          TEXT PRIMARY KEY,
    name                        TEXT NOT NULL,
    type                        TEXT NOT NULL,
    subscription_url_ciphertext TEXT,
    is_active                   INTEGER NOT NULL DEFAULT 0,
    sort_order                  INTEGER NOT NULL DEFAULT 0,
    created_at                  INTEGER NOT NULL,
    last_updated_at             INTEGER,
    title                       TEXT,
    upload_bytes                INTEGER NOT NULL DEFAULT 0,
    download_bytes              INTEGER NOT NULL DEFAULT 0,
    total_bytes                 INTEGER NOT NULL DEFAULT 0,
    expires_at                  INTEGER,
    update_interval_minutes     INTEGER NOT NULL DEFAULT 60,
    support_url                 TEXT
);

CREATE TABLE IF NOT EXISTS servers (
    id               TEXT PRIMARY KEY,
    profile_id       TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
    name             TEXT NOT NULL,
    address          TEXT NOT NULL,
    port             INTEGER NOT NULL,
    protocol         TEXT NOT NULL,
    config_data_json TEXT NOT NULL,
    remark           TEXT,
    is_favorite      INTEGER NOT NULL DEFAULT 0,
    sort_order       INTEGER NOT NULL DEFAULT 0,
    latency_ms       INTEGER,
    created_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_servers_profile ON servers(profile_id, sort_order);
";

/// Persisted shape of the protocol-specific column. The raw URI rides along
/// with the structured config so round-trip export survives a restart.
#[derive(Serialize, Deserialize)]
struct ConfigColumn {
    raw_uri: String,
    config: crate::model::ProtocolConfig,
}

pub struct ProfileStore {
    conn: Mutex<Connection>,
    profiles_tx: watch::Sender<Vec<Profile>>,
    active_tx: watch::Sender<Option<Profile>>,
}

impl ProfileStore {
    /// Opens (and migrates) a store at the given path
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory store, mainly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let (profiles_tx, _) = watch::channel(Vec::new());
        let (active_tx, _) = watch::channel(None);
        let store = Self {
            conn: Mutex::new(conn),
            profiles_tx,
            active_tx,
        };
        // Seed watchers with the persisted state
        let conn = store.conn.lock();
        let snapshot = list_profiles(&conn)?;
        drop(conn);
        store.publish(snapshot);
        Ok(store)
    }

    // ========================================================================
    // Watch
    // ========================================================================

    /// Reactive view over all profiles, ordered by sort order
    pub fn watch_all(&self) -> watch::Receiver<Vec<Profile>> {
        self.profiles_tx.subscribe()
    }

    /// Reactive view over the single active profile, if any
    pub fn watch_active(&self) -> watch::Receiver<Option<Profile>> {
        self.active_tx.subscribe()
    }

    fn publish(&self, snapshot: Vec<Profile>) {
        let active = snapshot.iter().find(|p| p.is_active).cloned();
        self.profiles_tx.send_replace(snapshot);
        self.active_tx.send_replace(active);
    }

    /// Runs a mutation inside one transaction and publishes the committed
    /// state to watchers. The serialization point for all writers.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        let snapshot = list_profiles(&conn)?;
        drop(conn);
        self.publish(snapshot);
        Ok(value)
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    /// Inserts a profile together with its initial server set in a single
    /// transaction, so a failure after the profile row never leaves a
    /// half-created profile behind.
    pub fn insert_profile_with_servers(
        &self,
        profile: &Profile,
        servers: &[ParsedServer],
    ) -> Result<(), StoreError> {
        debug!(
            "Inserting profile '{}' with {} servers",
            profile.name,
            servers.len()
        );
        self.mutate(|tx| {
            insert_profile_row(tx, profile)?;
            insert_server_rows(tx, profile.id, servers, profile.created_at)?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM profiles WHERE id = ?1",
            params![id.to_string()],
            profile_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Looks up a profile by the exact stored ciphertext of its URL
    pub fn get_by_subscription_url(
        &self,
        ciphertext: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM profiles WHERE subscription_url_ciphertext = ?1",
            params![ciphertext],
            profile_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let conn = self.conn.lock();
        list_profiles(&conn)
    }

    /// Deletes a profile; its servers go with it via cascade
    pub fn delete_profile(&self, id: Uuid) -> Result<(), StoreError> {
        self.mutate(|tx| {
            let affected = tx.execute(
                "DELETE FROM profiles WHERE id = ?1",
                params![id.to_string()],
            )?;
            if affected == 0 {
                return Err(StoreError::ProfileNotFound(id));
            }
            Ok(())
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM profiles", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Activates one profile, deactivating every other in the same
    /// transaction. At most one profile is ever active.
    pub fn set_active(&self, id: Uuid) -> Result<(), StoreError> {
        self.mutate(|tx| {
            let affected = tx.execute(
                "UPDATE profiles SET is_active = 1 WHERE id = ?1",
                params![id.to_string()],
            )?;
            if affected == 0 {
                return Err(StoreError::ProfileNotFound(id));
            }
            tx.execute(
                "UPDATE profiles SET is_active = 0 WHERE id != ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Applies profile sort orders atomically, then renumbers densely from
    /// zero in the resulting order.
    pub fn update_profile_sort_orders(
        &self,
        orders: &HashMap<Uuid, i64>,
    ) -> Result<(), StoreError> {
        self.mutate(|tx| {
            for (id, order) in orders {
                tx.execute(
                    "UPDATE profiles SET sort_order = ?1 WHERE id = ?2",
                    params![order, id.to_string()],
                )?;
            }
            let ids: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM profiles ORDER BY sort_order, created_at")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };
            for (index, id) in ids.iter().enumerate() {
                tx.execute(
                    "UPDATE profiles SET sort_order = ?1 WHERE id = ?2",
                    params![index as i64, id],
                )?;
            }
            Ok(())
        })
    }

    /// Applies a successful sync: subscription metadata and the wholesale
    /// server replacement land in one transaction. A failure anywhere
    /// leaves the previous profile and server set untouched.
    pub fn apply_sync_result(
        &self,
        profile_id: Uuid,
        info: &SubscriptionInfo,
        synced_at: DateTime<Utc>,
        servers: &[ParsedServer],
    ) -> Result<(), StoreError> {
        debug!(
            "Applying sync result for {}: {} servers",
            profile_id,
            servers.len()
        );
        self.mutate(|tx| {
            let affected = tx.execute(
                "UPDATE profiles SET
                    title = ?1, upload_bytes = ?2, download_bytes = ?3,
                    total_bytes = ?4, expires_at = ?5,
                    update_interval_minutes = ?6, support_url = ?7,
                    last_updated_at = ?8
                 WHERE id = ?9",
                params![
                    info.title,
                    info.upload_bytes as i64,
                    info.download_bytes as i64,
                    info.total_bytes as i64,
                    info.expires_at.map(|t| t.timestamp()),
                    info.update_interval_minutes,
                    info.support_url,
                    synced_at.timestamp(),
                    profile_id.to_string(),
                ],
            )?;
            if affected == 0 {
                return Err(StoreError::ProfileNotFound(profile_id));
            }
            replace_server_rows(tx, profile_id, servers, synced_at)?;
            Ok(())
        })
    }

    // ========================================================================
    // Servers
    // ========================================================================

    /// Replaces a profile's entire server set transactionally. Either all
    /// of `servers` become the set, or the previous set survives intact.
    pub fn replace_servers(
        &self,
        profile_id: Uuid,
        servers: &[ParsedServer],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.mutate(|tx| {
            ensure_profile_exists(tx, profile_id)?;
            replace_server_rows(tx, profile_id, servers, now)?;
            Ok(())
        })
    }

    pub fn servers_of(&self, profile_id: Uuid) -> Result<Vec<Server>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM servers WHERE profile_id = ?1 ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(params![profile_id.to_string()], server_from_row)?;
        let mut servers = Vec::new();
        for row in rows {
            servers.push(row??);
        }
        Ok(servers)
    }

    /// Reorders a profile's servers to the given id order; any server not
    /// listed keeps its relative position after the listed ones. Sort
    /// orders come out dense and zero-based.
    pub fn update_server_sort_orders(
        &self,
        profile_id: Uuid,
        ordered_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        self.mutate(|tx| {
            for (index, id) in ordered_ids.iter().enumerate() {
                tx.execute(
                    "UPDATE servers SET sort_order = ?1 WHERE id = ?2 AND profile_id = ?3",
                    params![index as i64, id.to_string(), profile_id.to_string()],
                )?;
            }
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM servers WHERE profile_id = ?1 ORDER BY sort_order, created_at",
                )?;
                let rows = stmt.query_map(params![profile_id.to_string()], |r| {
                    r.get::<_, String>(0)
                })?;
                rows.collect::<Result<_, _>>()?
            };
            for (index, id) in ids.iter().enumerate() {
                tx.execute(
                    "UPDATE servers SET sort_order = ?1 WHERE id = ?2",
                    params![index as i64, id],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_favorite(&self, server_id: Uuid, favorite: bool) -> Result<(), StoreError> {
        self.mutate(|tx| {
            tx.execute(
                "UPDATE servers SET is_favorite = ?1 WHERE id = ?2",
                params![favorite, server_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn set_remark(&self, server_id: Uuid, remark: Option<&str>) -> Result<(), StoreError> {
        self.mutate(|tx| {
            tx.execute(
                "UPDATE servers SET remark = ?1 WHERE id = ?2",
                params![remark, server_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn set_latency(&self, server_id: Uuid, latency_ms: Option<i64>) -> Result<(), StoreError> {
        self.mutate(|tx| {
            tx.execute(
                "UPDATE servers SET latency_ms = ?1 WHERE id = ?2",
                params![latency_ms, server_id.to_string()],
            )?;
            Ok(())
        })
    }
}

// ============================================================================
// Row Plumbing
// ============================================================================

fn ensure_profile_exists(
    tx: &rusqlite::Transaction<'_>,
    profile_id: Uuid,
) -> Result<(), StoreError> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM profiles WHERE id = ?1",
            params![profile_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::ProfileNotFound(profile_id));
    }
    Ok(())
}

fn insert_profile_row(
    tx: &rusqlite::Transaction<'_>,
    profile: &Profile,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO profiles (
            id, name, type, subscription_url_ciphertext, is_active, sort_order,
            created_at, last_updated_at, title, upload_bytes, download_bytes,
            total_bytes, expires_at, update_interval_minutes, support_url
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            profile.id.to_string(),
            profile.name,
            profile.kind.as_str(),
            profile.subscription_url,
            profile.is_active,
            profile.sort_order,
            profile.created_at.timestamp(),
            profile.last_updated_at.map(|t| t.timestamp()),
            profile.info.title,
            profile.info.upload_bytes as i64,
            profile.info.download_bytes as i64,
            profile.info.total_bytes as i64,
            profile.info.expires_at.map(|t| t.timestamp()),
            profile.info.update_interval_minutes,
            profile.info.support_url,
        ],
    )?;
    Ok(())
}

fn insert_server_rows(
    tx: &rusqlite::Transaction<'_>,
    profile_id: Uuid,
    servers: &[ParsedServer],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        "INSERT INTO servers (
            id, profile_id, name, address, port, protocol, config_data_json,
            remark, is_favorite, sort_order, latency_ms, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0, ?8, NULL, ?9)",
    )?;
    for (index, parsed) in servers.iter().enumerate() {
        let column = ConfigColumn {
            raw_uri: parsed.raw_uri.clone(),
            config: parsed.config.clone(),
        };
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            profile_id.to_string(),
            parsed.name,
            parsed.address,
            parsed.port,
            parsed.config.scheme(),
            serde_json::to_string(&column)?,
            index as i64,
            now.timestamp(),
        ])?;
    }
    Ok(())
}

fn replace_server_rows(
    tx: &rusqlite::Transaction<'_>,
    profile_id: Uuid,
    servers: &[ParsedServer],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM servers WHERE profile_id = ?1",
        params![profile_id.to_string()],
    )?;
    insert_server_rows(tx, profile_id, servers, now)
}

fn list_profiles(conn: &Connection) -> Result<Vec<Profile>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM profiles ORDER BY sort_order, created_at")?;
    let rows = stmt.query_map([], profile_from_row)?;
    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(row?);
    }
    Ok(profiles)
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let id: String = row.get("id")?;
    let kind: String = row.get("type")?;
    let created_at: i64 = row.get("created_at")?;
    let last_updated_at: Option<i64> = row.get("last_updated_at")?;
    let expires_at: Option<i64> = row.get("expires_at")?;

    Ok(Profile {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get("name")?,
        kind: ProfileKind::from_str(&kind).unwrap_or(ProfileKind::Local),
        subscription_url: row.get("subscription_url_ciphertext")?,
        is_active: row.get("is_active")?,
        sort_order: row.get("sort_order")?,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
        last_updated_at: last_updated_at.and_then(|t| DateTime::from_timestamp(t, 0)),
        info: SubscriptionInfo {
            title: row.get("title")?,
            upload_bytes: row.get::<_, i64>("upload_bytes")? as u64,
            download_bytes: row.get::<_, i64>("download_bytes")? as u64,
            total_bytes: row.get::<_, i64>("total_bytes")? as u64,
            expires_at: expires_at.and_then(|t| DateTime::from_timestamp(t, 0)),
            update_interval_minutes: row.get("update_interval_minutes")?,
            support_url: row.get("support_url")?,
        },
    })
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Server, StoreError>> {
    let id: String = row.get("id")?;
    let profile_id: String = row.get("profile_id")?;
    let config_json: String = row.get("config_data_json")?;
    let created_at: i64 = row.get("created_at")?;

    let column: ConfigColumn = match serde_json::from_str(&config_json) {
        Ok(column) => column,
        Err(e) => return Ok(Err(StoreError::Serialization(e))),
    };

    Ok(Ok(Server {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        profile_id: Uuid::parse_str(&profile_id).unwrap_or_default(),
        name: row.get("name")?,
        address: row.get("address")?,
        port: row.get("port")?,
        raw_uri: column.raw_uri,
        config: column.config,
        remark: row.get("remark")?,
        is_favorite: row.get("is_favorite")?,
        sort_order: row.get("sort_order")?,
        latency_ms: row.get("latency_ms")?,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    }))
}
