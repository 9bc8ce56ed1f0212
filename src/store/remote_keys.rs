use rusqlite::{params, Connection, OptionalExtension};

use super::{FeedStore, StoreResult};
use crate::db::models::{Direction, RemoteKey};

/// How a page load moves its bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdate {
    /// Upsert the bookmark for `key.direction`.
    Set(RemoteKey),
    /// Drop the bookmark; the direction is exhausted.
    Remove(Direction),
}

impl FeedStore {
    pub fn remote_key(&self, direction: Direction) -> StoreResult<Option<RemoteKey>> {
        let conn = self.pool.get()?;
        let key = conn
            .query_row(
                "SELECT direction, anchor_id FROM remote_keys WHERE direction = ?1",
                params![direction],
                |row| {
                    Ok(RemoteKey {
                        direction: row.get(0)?,
                        anchor_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(key)
    }

    pub fn remote_keys(&self) -> StoreResult<Vec<RemoteKey>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT direction, anchor_id FROM remote_keys ORDER BY direction")?;
        let keys = stmt
            .query_map([], |row| {
                Ok(RemoteKey {
                    direction: row.get(0)?,
                    anchor_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn set_remote_key(&self, key: RemoteKey) -> StoreResult<()> {
        let conn = self.pool.get()?;
        write_key(&conn, &key)?;
        Ok(())
    }

    pub fn remove_remote_key(&self, direction: Direction) -> StoreResult<()> {
        let conn = self.pool.get()?;
        apply_update(&conn, KeyUpdate::Remove(direction))?;
        Ok(())
    }
}

pub(super) fn write_key(conn: &Connection, key: &RemoteKey) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO remote_keys (direction, anchor_id) VALUES (?1, ?2)
         ON CONFLICT(direction) DO UPDATE SET anchor_id = excluded.anchor_id",
        params![key.direction, key.anchor_id],
    )?;
    Ok(())
}

pub(super) fn apply_update(conn: &Connection, update: KeyUpdate) -> Result<(), rusqlite::Error> {
    match update {
        KeyUpdate::Set(key) => write_key(conn, &key),
        KeyUpdate::Remove(direction) => {
            conn.execute(
                "DELETE FROM remote_keys WHERE direction = ?1",
                params![direction],
            )?;
            Ok(())
        }
    }
}
