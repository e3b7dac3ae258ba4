use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};

use tandem_core::{
    hlc::{Hlc, HlcClock},
    ids::{EntityId, EntityKey, EntityKind},
    state::EntityState,
};

use crate::error::StorageError;
use crate::traits::{EntityRecord, Storage};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
    clock: HlcClock,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            clock: HlcClock::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            clock: HlcClock::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

type EntityRow = (String, String, Vec<u8>, Vec<u8>, Vec<u8>);

fn read_entity_row(row: &rusqlite::Row) -> rusqlite::Result<EntityRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_entity(row: EntityRow) -> Result<EntityRecord, StorageError> {
    let (kind, id, state_bytes, digest_bytes, updated_at_bytes) = row;
    let key = EntityKey::new(EntityKind::parse(&kind)?, EntityId::new(id)?);
    let state = EntityState::from_msgpack(&state_bytes)?;
    let digest = to_array::<32>(digest_bytes, "digest")?;
    let updated_at = Hlc::from_bytes(&to_array::<12>(updated_at_bytes, "updated_at")?);
    Ok(EntityRecord {
        key,
        state,
        digest,
        updated_at,
    })
}

impl Storage for SqliteStorage {
    fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT entity_kind, entity_id, state, digest, updated_at FROM entities WHERE entity_kind = ?1 AND entity_id = ?2",
                rusqlite::params![key.kind.as_str(), key.id.as_str()],
                read_entity_row,
            )
            .optional()?;
        row.map(decode_entity).transpose()
    }

    fn put_entity(&mut self, key: &EntityKey, state: &EntityState) -> Result<EntityRecord, StorageError> {
        let state_bytes = state.to_msgpack()?;
        let digest = state.digest()?;
        let updated_at = self.clock.tick()?;
        self.conn.execute(
            "INSERT INTO entities (entity_kind, entity_id, state, digest, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_kind, entity_id) DO UPDATE SET state = excluded.state, digest = excluded.digest, updated_at = excluded.updated_at",
            rusqlite::params![
                key.kind.as_str(),
                key.id.as_str(),
                state_bytes,
                &digest[..],
                &updated_at.to_bytes()[..],
            ],
        )?;
        Ok(EntityRecord {
            key: key.clone(),
            state: state.clone(),
            digest,
            updated_at,
        })
    }

    fn delete_entity(&mut self, key: &EntityKey) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM entities WHERE entity_kind = ?1 AND entity_id = ?2",
            rusqlite::params![key.kind.as_str(), key.id.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn snapshot(&self) -> Result<BTreeMap<EntityKey, EntityState>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, entity_id, state, digest, updated_at FROM entities ORDER BY entity_kind, entity_id",
        )?;
        let rows = stmt.query_map([], read_entity_row)?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let record = decode_entity(row?)?;
            snapshot.insert(record.key, record.state);
        }
        Ok(snapshot)
    }

    fn entity_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
