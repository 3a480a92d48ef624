//! SQLite-backed history store.
//!
//! Connection settings:
//! - `journal_mode = WAL` so readers are not blocked by the appending writer
//! - a configurable `busy_timeout`; `SQLITE_BUSY` past it surfaces as
//!   [`HistoryError::StorageUnavailable`]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params, types::Type};
use tracing::debug;

use super::{
    BranchInfo, HistoryStore, ReadHistoryBranchRequest, ReadRawHistoryBranchResponse, checksum,
    page_token, truncate_batch,
};
use crate::error::{HistoryError, Result};
use crate::event::{DataBlob, Encoding, HistoryEvent, encode_batch};
use crate::version_history::{BranchToken, FIRST_EVENT_ID};

/// Busy timeout used when none is configured.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS history_branch (
    branch_token BLOB PRIMARY KEY,
    tree_id      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS history_node (
    branch_token  BLOB    NOT NULL,
    node_id       INTEGER NOT NULL,
    last_event_id INTEGER NOT NULL,
    encoding      TEXT    NOT NULL,
    data          BLOB    NOT NULL,
    checksum      TEXT    NOT NULL,
    PRIMARY KEY (branch_token, node_id)
);
";

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if the query fails or the value does not fit.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }
    Ok(current)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

/// [`HistoryStore`] persisted in a single SQLite file.
#[derive(Debug)]
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open (or create) the store at `path`, configure pragmas and migrate.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or opening,
    /// configuring or migrating the database fails.
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create history store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open history store {}", path.display()))?;
        Self::from_connection(conn, busy_timeout)
    }

    /// Private in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot create the database.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory history store")?;
        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn from_connection(mut conn: Connection, busy_timeout: Duration) -> anyhow::Result<Self> {
        configure_connection(&conn, busy_timeout).context("configure sqlite pragmas")?;
        migrate(&mut conn).context("apply history store migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HistoryError::StorageUnavailable("history store connection poisoned".into()))
    }
}

fn branch_exists(conn: &Connection, branch_token: &BranchToken) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM history_branch WHERE branch_token = ?1",
            params![branch_token.as_bytes()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn branch_next_event_id(conn: &Connection, branch_token: &BranchToken) -> Result<i64> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(last_event_id) FROM history_node WHERE branch_token = ?1",
        params![branch_token.as_bytes()],
        |row| row.get(0),
    )?;
    Ok(last.map_or(FIRST_EVENT_ID, |last| last + 1))
}

fn insert_node(
    conn: &Connection,
    branch_token: &BranchToken,
    node_id: i64,
    last_event_id: i64,
    blob: &DataBlob,
) -> Result<()> {
    conn.execute(
        "INSERT INTO history_node (branch_token, node_id, last_event_id, encoding, data, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            branch_token.as_bytes(),
            node_id,
            last_event_id,
            blob.encoding.as_str(),
            blob.data,
            checksum(&blob.data),
        ],
    )?;
    Ok(())
}

impl HistoryStore for SqliteHistoryStore {
    fn new_branch(&self) -> Result<BranchToken> {
        let info = BranchInfo::new_tree();
        let token = info.to_token()?;
        self.conn()?.execute(
            "INSERT INTO history_branch (branch_token, tree_id) VALUES (?1, ?2)",
            params![token.as_bytes(), info.tree_id.to_string()],
        )?;
        Ok(token)
    }

    fn append_history_nodes(&self, branch_token: &BranchToken, events: &[HistoryEvent]) -> Result<usize> {
        let blob = encode_batch(events)?;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Err(HistoryError::invalid("event batch is empty"));
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !branch_exists(&tx, branch_token)? {
            return Err(HistoryError::BranchNotFound(branch_token.to_string()));
        }
        let expected = branch_next_event_id(&tx, branch_token)?;
        if first.event_id != expected {
            return Err(HistoryError::BranchDiscontinuity {
                branch: branch_token.to_string(),
                next_event_id: expected,
                first_event_id: first.event_id,
            });
        }
        insert_node(&tx, branch_token, first.event_id, last.event_id, &blob)?;
        tx.commit()?;
        Ok(blob.len())
    }

    fn delete_history_nodes(&self, branch_token: &BranchToken, from_node_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        if !branch_exists(&conn, branch_token)? {
            return Err(HistoryError::BranchNotFound(branch_token.to_string()));
        }
        let deleted = conn.execute(
            "DELETE FROM history_node WHERE branch_token = ?1 AND node_id >= ?2",
            params![branch_token.as_bytes(), from_node_id],
        )?;
        Ok(deleted)
    }

    fn delete_history_branch(&self, branch_token: &BranchToken) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM history_node WHERE branch_token = ?1",
            params![branch_token.as_bytes()],
        )?;
        tx.execute(
            "DELETE FROM history_branch WHERE branch_token = ?1",
            params![branch_token.as_bytes()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn read_raw_history_branch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> Result<ReadRawHistoryBranchResponse> {
        let resume_at = request.validate()?;
        let conn = self.conn()?;
        if !branch_exists(&conn, &request.branch_token)? {
            return Err(HistoryError::BranchNotFound(request.branch_token.to_string()));
        }

        let limit = i64::try_from(request.page_size.saturating_add(1)).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT node_id, encoding, data, checksum FROM history_node
             WHERE branch_token = ?1 AND node_id >= ?2 AND last_event_id >= ?3 AND node_id < ?4
             ORDER BY node_id
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                request.branch_token.as_bytes(),
                resume_at,
                request.min_event_id,
                request.max_event_id,
                limit
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        let mut response = ReadRawHistoryBranchResponse::default();
        for row in rows {
            let (node_id, encoding, data, stored_checksum) = row?;
            if response.blobs.len() == request.page_size {
                response.next_page_token = page_token(node_id);
                break;
            }
            if checksum(&data) != stored_checksum {
                return Err(HistoryError::CorruptedBlob {
                    branch: request.branch_token.to_string(),
                    node_id,
                });
            }
            response.size += data.len();
            response.blobs.push(DataBlob::new(encoding.parse::<Encoding>()?, data));
        }
        Ok(response)
    }

    fn fork_history_branch(&self, base: &BranchToken, fork_event_id: i64) -> Result<BranchToken> {
        let info = BranchInfo::from_token(base)?.fork();
        let token = info.to_token()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !branch_exists(&tx, base)? {
            return Err(HistoryError::BranchNotFound(base.to_string()));
        }
        let base_next = branch_next_event_id(&tx, base)?;
        if fork_event_id <= FIRST_EVENT_ID || fork_event_id > base_next {
            return Err(HistoryError::invalid(format!(
                "cannot fork branch {base} at event {fork_event_id}: next event id is {base_next}"
            )));
        }

        tx.execute(
            "INSERT INTO history_branch (branch_token, tree_id) VALUES (?1, ?2)",
            params![token.as_bytes(), info.tree_id.to_string()],
        )?;
        let copied = tx.execute(
            "INSERT INTO history_node (branch_token, node_id, last_event_id, encoding, data, checksum)
             SELECT ?1, node_id, last_event_id, encoding, data, checksum FROM history_node
             WHERE branch_token = ?2 AND last_event_id < ?3",
            params![token.as_bytes(), base.as_bytes(), fork_event_id],
        )?;

        let straddling: Option<(i64, String, Vec<u8>)> = tx
            .query_row(
                "SELECT node_id, encoding, data FROM history_node
                 WHERE branch_token = ?1 AND node_id < ?2 AND last_event_id >= ?2",
                params![base.as_bytes(), fork_event_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((node_id, encoding, data)) = straddling {
            let blob = DataBlob::new(encoding.parse::<Encoding>()?, data);
            let kept = truncate_batch(&blob, fork_event_id)?;
            let last_event_id = kept.last().map_or(node_id, |event| event.event_id);
            insert_node(&tx, &token, node_id, last_event_id, &encode_batch(&kept)?)?;
        }
        tx.commit()?;

        debug!(base = %base, fork_event_id, copied, "forked history branch");
        Ok(token)
    }
}
