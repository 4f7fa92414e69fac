//! sightline-store — SQLite persistence for identities and visits.
//!
//! One [`Database`] serves as the pipeline's identity registrar, visit
//! store and startup identity source, and answers the admin queries used
//! by the CLI.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sightline_core::{
    CollaboratorError, Embedding, Identity, IdentityId, IdentityRegistrar, IdentitySource,
    VisitStore,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT,
    embedding   BLOB NOT NULL,
    created_at  TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    visit_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS visits (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    snapshot  BLOB
);
CREATE INDEX IF NOT EXISTS visits_person_ts ON visits(person_id, timestamp);
";

const PERSON_COLUMNS: &str = "id, name, created_at, last_seen, visit_count";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt embedding for {id}: {len} bytes is not a whole number of f32 values")]
    CorruptEmbedding { id: String, len: usize },
    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),
}

/// A persisted visit.
#[derive(Debug, Clone, Serialize)]
pub struct VisitRecord {
    pub id: i64,
    pub identity: IdentityId,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
}

impl VisitRecord {
    pub fn snapshot_len(&self) -> Option<usize> {
        self.snapshot.as_ref().map(Vec::len)
    }
}

/// SQLite-backed identity registry and visit log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DatabaseError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a brand-new identity with its embedding.
    pub fn insert_identity(
        &self,
        identity: &Identity,
        embedding: &Embedding,
    ) -> Result<(), DatabaseError> {
        self.conn.lock().execute(
            "INSERT INTO persons (id, name, embedding, created_at, last_seen, visit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.id.to_string(),
                identity.name,
                encode_embedding(embedding),
                identity.created_at,
                identity.last_seen,
                identity.visit_count,
            ],
        )?;
        Ok(())
    }

    /// Every identity with a decodable embedding, oldest first. Rows that
    /// fail to decode are skipped with a warning.
    pub fn load_known(&self) -> Result<Vec<(Identity, Embedding)>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERSON_COLUMNS}, embedding FROM persons ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([], |row| Ok((PersonRow::from_row(row)?, row.get::<_, Vec<u8>>(5)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (person, blob) = row?;
            let raw_id = person.id.clone();
            match person
                .into_identity()
                .and_then(|identity| decode_embedding(&raw_id, &blob).map(|e| (identity, e)))
            {
                Ok(pair) => out.push(pair),
                Err(e) => tracing::warn!(id = %raw_id, error = %e, "skipping stored person"),
            }
        }
        Ok(out)
    }

    /// All identities, most recently seen first.
    pub fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERSON_COLUMNS} FROM persons ORDER BY last_seen DESC"
        ))?;
        let rows = stmt.query_map([], PersonRow::from_row)?;
        let identities = rows.map(|row| row?.into_identity()).collect();
        identities
    }

    pub fn get_identity(&self, id: IdentityId) -> Result<Option<Identity>, DatabaseError> {
        let person = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = ?1"),
                params![id.to_string()],
                PersonRow::from_row,
            )
            .optional()?;
        person.map(PersonRow::into_identity).transpose()
    }

    /// Set the display name; an empty or `None` name clears it. Returns
    /// `false` if the identity does not exist.
    pub fn rename_identity(&self, id: IdentityId, name: Option<&str>) -> Result<bool, DatabaseError> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let changed = self.conn.lock().execute(
            "UPDATE persons SET name = ?1 WHERE id = ?2",
            params![name, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Store the identity's updated counters and append a visit row in one
    /// transaction. Returns the new visit id.
    pub fn record_visit(
        &self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
        snapshot: Option<&[u8]>,
    ) -> Result<i64, DatabaseError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE persons SET last_seen = ?1, visit_count = ?2 WHERE id = ?3",
            params![identity.last_seen, identity.visit_count, identity.id.to_string()],
        )?;
        if updated == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows.into());
        }
        tx.execute(
            "INSERT INTO visits (person_id, timestamp, snapshot) VALUES (?1, ?2, ?3)",
            params![identity.id.to_string(), timestamp, snapshot],
        )?;
        let visit_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(visit_id)
    }

    /// Most recent visits first, optionally for one identity only.
    pub fn recent_visits(
        &self,
        limit: usize,
        person: Option<IdentityId>,
    ) -> Result<Vec<VisitRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, person_id, timestamp, snapshot FROM visits
             WHERE ?1 IS NULL OR person_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![person.map(|p| p.to_string()), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                    row.get::<_, Option<Vec<u8>>>(3)?,
                ))
            },
        )?;

        let visits = rows
            .map(|row| {
                let (id, person_id, timestamp, snapshot) = row?;
                Ok(VisitRecord {
                    id,
                    identity: parse_id(&person_id)?,
                    timestamp,
                    snapshot,
                })
            })
            .collect();
        visits
    }

    /// Number of visit rows stored for `id`.
    pub fn visit_count_for(&self, id: IdentityId) -> Result<u32, DatabaseError> {
        let count: u32 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM visits WHERE person_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl IdentityRegistrar for Database {
    fn register(
        &self,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<Identity, CollaboratorError> {
        let identity = Identity::new(IdentityId::new_v4(), now);
        self.insert_identity(&identity, embedding)
            .map_err(|e| CollaboratorError::Registration(e.to_string()))?;
        tracing::debug!(identity = %identity.id, dim = embedding.dim(), "person row inserted");
        Ok(identity)
    }
}

impl VisitStore for Database {
    fn persist(
        &self,
        identity: &Identity,
        timestamp: DateTime<Utc>,
        snapshot: Option<&[u8]>,
    ) -> Result<(), CollaboratorError> {
        self.record_visit(identity, timestamp, snapshot)
            .map(|_| ())
            .map_err(|e| CollaboratorError::Persistence(e.to_string()))
    }
}

impl IdentitySource for Database {
    fn load_identities(&self) -> Result<Vec<(Identity, Embedding)>, CollaboratorError> {
        self.load_known().map_err(|e| CollaboratorError::Load(e.to_string()))
    }
}

/// Raw `persons` columns, before the id is validated.
struct PersonRow {
    id: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    visit_count: u32,
}

impl PersonRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: row.get(2)?,
            last_seen: row.get(3)?,
            visit_count: row.get(4)?,
        })
    }

    fn into_identity(self) -> Result<Identity, DatabaseError> {
        Ok(Identity {
            id: parse_id(&self.id)?,
            name: self.name,
            created_at: self.created_at,
            last_seen: self.last_seen,
            visit_count: self.visit_count,
        })
    }
}

fn parse_id(raw: &str) -> Result<IdentityId, DatabaseError> {
    raw.parse()
        .map_err(|_| DatabaseError::InvalidIdentity(raw.to_string()))
}

/// Little-endian `f32` values, back to back.
fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(id: &str, blob: &[u8]) -> Result<Embedding, DatabaseError> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(DatabaseError::CorruptEmbedding {
            id: id.to_string(),
            len: blob.len(),
        });
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}
