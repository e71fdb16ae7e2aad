//! Optional activation bookkeeping.
//!
//! One record per (client machine, application group): first/last
//! request wall-clock, a ring of the last six request FILETIMEs, the
//! request counter, and the EPID assigned to the pair. Upserts are
//! single transactions; updates for one key are serialized by a per-key
//! lock while different keys proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension as _};
use uuid::Uuid;

/// Depth of the per-record request-time ring.
pub const RING_SIZE: usize = 6;

const RING_COLUMNS: [&str; RING_SIZE] = ["ring_1", "ring_2", "ring_3", "ring_4", "ring_5", "ring_6"];

/// Activation store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open activation store at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to migrate activation store schema")]
    Migrate(#[source] rusqlite::Error),
    #[error("activation store query failed")]
    Query(#[from] rusqlite::Error),
    #[error("activation store worker vanished")]
    Worker,
    #[error("corrupt activation record field `{0}`")]
    Corrupt(&'static str),
}

impl StoreError {
    /// Stable short name for structured events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Migrate(_) => "migrate",
            Self::Query(_) => "query",
            Self::Worker => "worker",
            Self::Corrupt(_) => "corrupt",
        }
    }
}

/// One activation record, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    pub cmid: Uuid,
    pub app_group: Uuid,
    pub sku: Uuid,
    pub epid: String,
    pub first_request_time: DateTime<Utc>,
    pub last_request_time: DateTime<Utc>,
    pub n_requests: u64,
    /// Request FILETIMEs, most recent first, at most [`RING_SIZE`].
    pub request_ring: Vec<u64>,
}

/// Input of an upsert: what the engine knows after serving a request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub cmid: Uuid,
    pub app_group: Uuid,
    pub sku: Uuid,
    pub epid: String,
    pub request_time: u64,
}

/// SQLite-backed activation store.
///
/// The connection is owned behind a mutex and exercised from blocking
/// tasks; SQLite provides the single-writer transaction guarantee.
#[derive(Clone)]
pub struct ActivationStore {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<tokio::sync::Mutex<HashMap<(Uuid, Uuid), Arc<tokio::sync::Mutex<()>>>>>,
}

impl ActivationStore {
    /// Opens (creating and migrating as needed) the store at `path`.
    ///
    /// `:memory:` yields a store private to this process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_owned(),
            source,
        })?;

        migrate(&conn).map_err(StoreError::Migrate)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        })
    }

    /// Upserts the record for `(cmid, app_group)` and returns its new
    /// state. The whole change is one transaction.
    pub async fn record_request(&self, request: RequestRecord) -> Result<ActivationRecord, StoreError> {
        let key_lock = self.key_lock(request.cmid, request.app_group).await;
        let _guard = key_lock.lock().await;

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("store mutex poisoned");
            upsert(&mut conn, &request)
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    /// EPID previously assigned to `(cmid, app_group)`, if any.
    pub async fn lookup_epid(&self, cmid: Uuid, app_group: Uuid) -> Result<Option<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.query_row(
                "SELECT epid FROM clients WHERE cmid = ?1 AND app_group = ?2",
                params![cmid.to_string(), app_group.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    /// Reads one record back; used by operators and the test suite.
    pub fn fetch(&self, cmid: Uuid, app_group: Uuid) -> Result<Option<ActivationRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        fetch_record(&conn, cmid, app_group)
    }

    async fn key_lock(&self, cmid: Uuid, app_group: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry((cmid, app_group)).or_default())
    }
}

/// One-way, idempotent schema migration: creates the table when absent
/// and adds columns with defaults; never drops or renames.
fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS clients(
            cmid TEXT NOT NULL,
            app_group TEXT NOT NULL,
            sku TEXT NOT NULL,
            epid TEXT NOT NULL,
            first_request_time TEXT NOT NULL,
            last_request_time TEXT NOT NULL,
            n_requests INTEGER NOT NULL DEFAULT 1,
            ring_1 INTEGER, ring_2 INTEGER, ring_3 INTEGER,
            ring_4 INTEGER, ring_5 INTEGER, ring_6 INTEGER,
            PRIMARY KEY (cmid, app_group)
        )",
    )?;

    for column in RING_COLUMNS {
        ensure_column(conn, column, "INTEGER")?;
    }

    Ok(())
}

fn ensure_column(conn: &Connection, name: &str, kind: &str) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('clients')")?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(Result::ok)
        .any(|existing| existing == name);

    if !exists {
        conn.execute_batch(&format!("ALTER TABLE clients ADD COLUMN {name} {kind}"))?;
    }

    Ok(())
}

fn upsert(conn: &mut Connection, request: &RequestRecord) -> Result<ActivationRecord, StoreError> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let cmid = request.cmid.to_string();
    let app_group = request.app_group.to_string();

    let tx = conn.transaction()?;

    let existing: Option<(i64, Vec<Option<i64>>)> = tx
        .query_row(
            "SELECT n_requests, ring_1, ring_2, ring_3, ring_4, ring_5, ring_6
             FROM clients WHERE cmid = ?1 AND app_group = ?2",
            params![cmid, app_group],
            |row| {
                let n: i64 = row.get(0)?;
                let mut ring = Vec::with_capacity(RING_SIZE);
                for i in 0..RING_SIZE {
                    ring.push(row.get::<_, Option<i64>>(1 + i)?);
                }
                Ok((n, ring))
            },
        )
        .optional()?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO clients
                 (cmid, app_group, sku, epid, first_request_time, last_request_time, n_requests, ring_1)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6)",
                params![
                    cmid,
                    app_group,
                    request.sku.to_string(),
                    request.epid,
                    now,
                    request.request_time as i64
                ],
            )?;
        }
        Some((n_requests, old_ring)) => {
            let mut ring: Vec<Option<i64>> = Vec::with_capacity(RING_SIZE);
            ring.push(Some(request.request_time as i64));
            ring.extend(old_ring.into_iter().take(RING_SIZE - 1));
            ring.resize(RING_SIZE, None);

            tx.execute(
                "UPDATE clients SET
                 sku = ?3, epid = ?4, last_request_time = ?5, n_requests = ?6,
                 ring_1 = ?7, ring_2 = ?8, ring_3 = ?9, ring_4 = ?10, ring_5 = ?11, ring_6 = ?12
                 WHERE cmid = ?1 AND app_group = ?2",
                params![
                    cmid,
                    app_group,
                    request.sku.to_string(),
                    request.epid,
                    now,
                    n_requests + 1,
                    ring[0],
                    ring[1],
                    ring[2],
                    ring[3],
                    ring[4],
                    ring[5],
                ],
            )?;
        }
    }

    let record = fetch_record(&tx, request.cmid, request.app_group)?.ok_or(StoreError::Corrupt("cmid"))?;
    tx.commit()?;

    Ok(record)
}

fn fetch_record(
    conn: &Connection,
    cmid: Uuid,
    app_group: Uuid,
) -> Result<Option<ActivationRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT sku, epid, first_request_time, last_request_time, n_requests,
                    ring_1, ring_2, ring_3, ring_4, ring_5, ring_6
             FROM clients WHERE cmid = ?1 AND app_group = ?2",
            params![cmid.to_string(), app_group.to_string()],
            |row| {
                let sku: String = row.get(0)?;
                let epid: String = row.get(1)?;
                let first: String = row.get(2)?;
                let last: String = row.get(3)?;
                let n_requests: i64 = row.get(4)?;
                let mut ring = Vec::with_capacity(RING_SIZE);
                for i in 0..RING_SIZE {
                    ring.push(row.get::<_, Option<i64>>(5 + i)?);
                }
                Ok((sku, epid, first, last, n_requests, ring))
            },
        )
        .optional()?;

    let Some((sku, epid, first, last, n_requests, ring)) = row else {
        return Ok(None);
    };

    Ok(Some(ActivationRecord {
        cmid,
        app_group,
        sku: sku.parse().map_err(|_| StoreError::Corrupt("sku"))?,
        epid,
        first_request_time: parse_timestamp(&first).ok_or(StoreError::Corrupt("first_request_time"))?,
        last_request_time: parse_timestamp(&last).ok_or(StoreError::Corrupt("last_request_time"))?,
        n_requests: n_requests.max(0) as u64,
        request_ring: ring.into_iter().flatten().map(|t| t as u64).collect(),
    }))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::uuid;

    const CMID: Uuid = uuid!("00112233-4455-6677-8899-aabbccddeeff");
    const GROUP: Uuid = uuid!("55c92734-d682-4d71-983e-d6ec3f16059f");
    const SKU: Uuid = uuid!("2de67392-b7a7-462a-b1ca-108dd189f588");

    fn request(time: u64) -> RequestRecord {
        RequestRecord {
            cmid: CMID,
            app_group: GROUP,
            sku: SKU,
            epid: "03612051234560301033.1555526400".to_owned(),
            request_time: time,
        }
    }

    #[tokio::test]
    async fn first_insert_creates_record() {
        let store = ActivationStore::open(":memory:").unwrap();

        let record = store.record_request(request(100)).await.unwrap();

        assert_eq!(record.n_requests, 1);
        assert_eq!(record.request_ring, vec![100]);
        assert_eq!(record.first_request_time, record.last_request_time);
    }

    #[tokio::test]
    async fn repeat_requests_increment_and_ring() {
        let store = ActivationStore::open(":memory:").unwrap();

        for time in 1..=8u64 {
            store.record_request(request(time)).await.unwrap();
        }

        let record = store.fetch(CMID, GROUP).unwrap().unwrap();
        assert_eq!(record.n_requests, 8);
        // Most recent first, capped at six.
        assert_eq!(record.request_ring, vec![8, 7, 6, 5, 4, 3]);
    }

    #[tokio::test]
    async fn epid_survives_and_is_looked_up() {
        let store = ActivationStore::open(":memory:").unwrap();

        assert_eq!(store.lookup_epid(CMID, GROUP).await.unwrap(), None);
        store.record_request(request(1)).await.unwrap();

        let epid = store.lookup_epid(CMID, GROUP).await.unwrap().unwrap();
        assert_eq!(epid, "03612051234560301033.1555526400");
    }

    #[tokio::test]
    async fn groups_are_separate_records() {
        let store = ActivationStore::open(":memory:").unwrap();
        let other_group = uuid!("0ff1ce15-a989-479d-af46-f275c6370663");

        store.record_request(request(1)).await.unwrap();
        let mut office = request(2);
        office.app_group = other_group;
        store.record_request(office).await.unwrap();

        assert_eq!(store.fetch(CMID, GROUP).unwrap().unwrap().n_requests, 1);
        assert_eq!(store.fetch(CMID, other_group).unwrap().unwrap().n_requests, 1);
    }

    #[test]
    fn migration_is_idempotent_and_additive() {
        let conn = Connection::open_in_memory().unwrap();
        // A store created before the request-time ring existed.
        conn.execute_batch(
            "CREATE TABLE clients(
                cmid TEXT NOT NULL,
                app_group TEXT NOT NULL,
                sku TEXT NOT NULL,
                epid TEXT NOT NULL,
                first_request_time TEXT NOT NULL,
                last_request_time TEXT NOT NULL,
                n_requests INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (cmid, app_group)
            )",
        )
        .unwrap();

        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let columns: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('clients')")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        for ring in RING_COLUMNS {
            assert!(columns.iter().any(|c| c == ring), "missing {ring}");
        }
    }
}
