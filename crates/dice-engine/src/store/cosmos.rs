//! Persistence for the cosmos: hosts, fingerprints, labels, scans, hooks,
//! and the transient sources table.
//!
//! Cosmos entities share one monotonic id space: hooks and events route by
//! bare object id, so a host and a scan must never carry the same number.
//! The store hands ids out from a single counter seeded from the tables at
//! open.
//!
//! Hosts are cached in a TTL-bounded LRU. Fingerprint and label writes
//! change a host's back-references, so they drop the cached entry for the
//! affected host. The hook table is durable: resumption after a crash
//! depends on it.
//!
//! Every `add_*` persists its whole slice in a single transaction. The
//! matching `delete_*` methods exist for the adapter's compensating
//! rollback when event delivery fails.

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dice_core::error::{Error, Result};
use dice_core::model::{Fingerprint, Hook, Host, Id, Label, Scan, Source, SourceKind};
use moka::sync::Cache;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::trace;

use super::lock;

/// Maximum number of cached hosts.
const HOST_CACHE_CAPACITY: u64 = 1024;

/// Cached hosts expire after this long.
const HOST_CACHE_TTL_SECS: u64 = 300;

/// Store for `cosmos.db` plus the in-memory sources table.
pub struct CosmosStore {
    conn: Arc<Mutex<Connection>>,
    sources: Arc<Mutex<Connection>>,
    cache: Cache<Id, Host>,
    next_id: Cell<u64>,
}

impl CosmosStore {
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>, sources: Arc<Mutex<Connection>>) -> Self {
        let cache = Cache::builder()
            .max_capacity(HOST_CACHE_CAPACITY)
            .time_to_live(Duration::from_secs(HOST_CACHE_TTL_SECS))
            .build();
        let next_id = Cell::new(Self::seed_next_id(&conn));
        Self {
            conn,
            sources,
            cache,
            next_id,
        }
    }

    /// One past the highest id already stored, so reopening a store keeps
    /// assignment monotonic.
    fn seed_next_id(conn: &Arc<Mutex<Connection>>) -> u64 {
        let Ok(conn) = conn.lock() else { return 1 };
        let max: i64 = conn
            .query_row(
                "SELECT max(
                    coalesce((SELECT max(id) FROM hosts), 0),
                    coalesce((SELECT max(id) FROM fingerprints), 0),
                    coalesce((SELECT max(id) FROM labels), 0),
                    coalesce((SELECT max(id) FROM scans), 0)
                )",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        #[allow(clippy::cast_sign_loss)]
        {
            max as u64 + 1
        }
    }

    /// Allocates `n` consecutive ids from the shared sequence.
    fn allocate(&self, n: u64) -> u64 {
        let start = self.next_id.get();
        self.next_id.set(start + n);
        start
    }

    /// Creates the durable tables.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY,
                ip TEXT NOT NULL,
                domain TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fingerprints (
                id INTEGER PRIMARY KEY,
                host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                module_id INTEGER NOT NULL,
                data BLOB NOT NULL,
                hash TEXT NOT NULL,
                service TEXT NOT NULL,
                protocol TEXT NOT NULL,
                port INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints_host ON fingerprints(host_id);
            CREATE TABLE IF NOT EXISTS labels (
                id INTEGER PRIMARY KEY,
                host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                short TEXT NOT NULL,
                long TEXT NOT NULL,
                description TEXT NOT NULL,
                mitigation TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_labels_host ON labels(host_id);
            CREATE TABLE IF NOT EXISTS scans (
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                targets TEXT NOT NULL,
                args TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS hooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                UNIQUE(object_id, node_id)
            );
            CREATE INDEX IF NOT EXISTS idx_hooks_object ON hooks(object_id);",
        )
    }

    /// Creates the transient sources table.
    pub fn init_sources_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                format TEXT NOT NULL,
                location TEXT NOT NULL,
                args TEXT
            );",
        )
    }

    // --- hosts ---

    /// Inserts hosts in one transaction, returning them with assigned ids.
    /// Freshly inserted hosts populate the cache.
    pub fn add_hosts(&self, hosts: Vec<Host>) -> Result<Vec<Host>> {
        let now = Utc::now();
        let base = self.allocate(hosts.len() as u64);
        let mut stored = Vec::with_capacity(hosts.len());
        {
            let mut conn = lock(&self.conn, "add_hosts")?;
            let tx = conn.transaction().map_err(|e| Error::store("add_hosts", e))?;
            for (offset, mut host) in hosts.into_iter().enumerate() {
                host.id = Id(base + offset as u64);
                tx.execute(
                    "INSERT INTO hosts (id, ip, domain, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![host.id, host.ip, host.domain, now.to_rfc3339()],
                )
                .map_err(|e| Error::store("add_hosts", e))?;
                host.created_at = Some(now);
                stored.push(host);
            }
            tx.commit().map_err(|e| Error::store("add_hosts", e))?;
        }
        for host in &stored {
            self.cache.insert(host.id, host.clone());
        }
        Ok(stored)
    }

    /// Compensating rollback for [`Self::add_hosts`].
    pub fn delete_hosts(&self, ids: &[Id]) -> Result<()> {
        let conn = lock(&self.conn, "delete_hosts")?;
        for id in ids {
            conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])
                .map_err(|e| Error::store("delete_hosts", e))?;
            self.cache.invalidate(id);
        }
        Ok(())
    }

    /// Fetches a host with its fingerprints and labels, cache first.
    pub fn get_host(&self, id: Id) -> Result<Host> {
        if let Some(host) = self.cache.get(&id) {
            trace!(host = %id, "host cache hit");
            return Ok(host);
        }
        let conn = lock(&self.conn, "get_host")?;
        let host = Self::host_on(&conn, id)?;
        drop(conn);
        self.cache.insert(id, host.clone());
        Ok(host)
    }

    fn host_on(conn: &Connection, id: Id) -> Result<Host> {
        let mut host = conn
            .query_row(
                "SELECT id, ip, domain, created_at FROM hosts WHERE id = ?1",
                params![id],
                row_to_host,
            )
            .optional()
            .map_err(|e| Error::store("get_host", e))?
            .ok_or_else(|| Error::not_found("host", id))?;
        host.fingerprints = Self::fingerprints_of(conn, id)?;
        host.labels = Self::labels_of(conn, id)?;
        Ok(host)
    }

    /// Hosts whose ip or domain matches the glob pattern.
    pub fn query_hosts(&self, pattern: &str) -> Result<Vec<Host>> {
        let conn = lock(&self.conn, "query_hosts")?;
        let ids: Vec<Id> = {
            let mut stmt = conn
                .prepare("SELECT id FROM hosts WHERE ip GLOB ?1 OR domain GLOB ?1 ORDER BY id")
                .map_err(|e| Error::store("query_hosts", e))?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get(0))
                .map_err(|e| Error::store("query_hosts", e))?;
            rows.collect::<rusqlite::Result<Vec<Id>>>()
                .map_err(|e| Error::store("query_hosts", e))?
        };
        ids.into_iter().map(|id| Self::host_on(&conn, id)).collect()
    }

    // --- fingerprints ---

    pub fn add_fingerprints(&self, fingerprints: Vec<Fingerprint>) -> Result<Vec<Fingerprint>> {
        let now = Utc::now();
        let base = self.allocate(fingerprints.len() as u64);
        let mut stored = Vec::with_capacity(fingerprints.len());
        {
            let mut conn = lock(&self.conn, "add_fingerprints")?;
            let tx = conn
                .transaction()
                .map_err(|e| Error::store("add_fingerprints", e))?;
            for (offset, mut fp) in fingerprints.into_iter().enumerate() {
                fp.id = Id(base + offset as u64);
                tx.execute(
                    "INSERT INTO fingerprints
                        (id, host_id, module_id, data, hash, service, protocol, port, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        fp.id,
                        fp.host_id,
                        fp.module_id,
                        fp.data,
                        fp.hash,
                        fp.service,
                        fp.protocol,
                        fp.port,
                        now.to_rfc3339()
                    ],
                )
                .map_err(|e| Error::store("add_fingerprints", e))?;
                fp.created_at = Some(now);
                stored.push(fp);
            }
            tx.commit().map_err(|e| Error::store("add_fingerprints", e))?;
        }
        // The cached host no longer reflects its fingerprint set.
        for fp in &stored {
            self.cache.invalidate(&fp.host_id);
        }
        Ok(stored)
    }

    pub fn delete_fingerprints(&self, ids: &[Id]) -> Result<()> {
        let conn = lock(&self.conn, "delete_fingerprints")?;
        for id in ids {
            conn.execute("DELETE FROM fingerprints WHERE id = ?1", params![id])
                .map_err(|e| Error::store("delete_fingerprints", e))?;
        }
        Ok(())
    }

    fn fingerprints_of(conn: &Connection, host_id: Id) -> Result<Vec<Fingerprint>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, host_id, module_id, data, hash, service, protocol, port, created_at
                 FROM fingerprints WHERE host_id = ?1 ORDER BY id",
            )
            .map_err(|e| Error::store("get_host", e))?;
        let rows = stmt
            .query_map(params![host_id], row_to_fingerprint)
            .map_err(|e| Error::store("get_host", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store("get_host", e))
    }

    // --- labels ---

    pub fn add_labels(&self, labels: Vec<Label>) -> Result<Vec<Label>> {
        let now = Utc::now();
        let base = self.allocate(labels.len() as u64);
        let mut stored = Vec::with_capacity(labels.len());
        {
            let mut conn = lock(&self.conn, "add_labels")?;
            let tx = conn
                .transaction()
                .map_err(|e| Error::store("add_labels", e))?;
            for (offset, mut label) in labels.into_iter().enumerate() {
                label.id = Id(base + offset as u64);
                tx.execute(
                    "INSERT INTO labels
                        (id, host_id, short, long, description, mitigation, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        label.id,
                        label.host_id,
                        label.short,
                        label.long,
                        label.description,
                        label.mitigation,
                        now.to_rfc3339()
                    ],
                )
                .map_err(|e| Error::store("add_labels", e))?;
                label.created_at = Some(now);
                stored.push(label);
            }
            tx.commit().map_err(|e| Error::store("add_labels", e))?;
        }
        // Label counts are read back through the host; expire the entries.
        for label in &stored {
            self.cache.invalidate(&label.host_id);
        }
        Ok(stored)
    }

    pub fn delete_labels(&self, ids: &[Id]) -> Result<()> {
        let conn = lock(&self.conn, "delete_labels")?;
        for id in ids {
            conn.execute("DELETE FROM labels WHERE id = ?1", params![id])
                .map_err(|e| Error::store("delete_labels", e))?;
        }
        Ok(())
    }

    fn labels_of(conn: &Connection, host_id: Id) -> Result<Vec<Label>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, host_id, short, long, description, mitigation, created_at
                 FROM labels WHERE host_id = ?1 ORDER BY id",
            )
            .map_err(|e| Error::store("get_host", e))?;
        let rows = stmt
            .query_map(params![host_id], row_to_label)
            .map_err(|e| Error::store("get_host", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store("get_host", e))
    }

    // --- scans ---

    pub fn add_scans(&self, scans: Vec<Scan>) -> Result<Vec<Scan>> {
        let now = Utc::now();
        let base = self.allocate(scans.len() as u64);
        let mut conn = lock(&self.conn, "add_scans")?;
        let tx = conn.transaction().map_err(|e| Error::store("add_scans", e))?;
        let mut stored = Vec::with_capacity(scans.len());
        for (offset, mut scan) in scans.into_iter().enumerate() {
            scan.id = Id(base + offset as u64);
            let targets =
                serde_json::to_string(&scan.targets).map_err(|e| Error::store("add_scans", e))?;
            tx.execute(
                "INSERT INTO scans (id, module_id, targets, args, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![scan.id, scan.module_id, targets, scan.args, now.to_rfc3339()],
            )
            .map_err(|e| Error::store("add_scans", e))?;
            scan.created_at = Some(now);
            stored.push(scan);
        }
        tx.commit().map_err(|e| Error::store("add_scans", e))?;
        Ok(stored)
    }

    pub fn delete_scans(&self, ids: &[Id]) -> Result<()> {
        let conn = lock(&self.conn, "delete_scans")?;
        for id in ids {
            conn.execute("DELETE FROM scans WHERE id = ?1", params![id])
                .map_err(|e| Error::store("delete_scans", e))?;
        }
        Ok(())
    }

    pub fn get_scan(&self, id: Id) -> Result<Scan> {
        let conn = lock(&self.conn, "get_scan")?;
        conn.query_row(
            "SELECT id, module_id, targets, args, created_at FROM scans WHERE id = ?1",
            params![id],
            row_to_scan,
        )
        .optional()
        .map_err(|e| Error::store("get_scan", e))?
        .ok_or_else(|| Error::not_found("scan", id))
    }

    // --- sources (transient) ---

    pub fn add_sources(&self, sources: Vec<Source>) -> Result<Vec<Source>> {
        let base = self.allocate(sources.len() as u64);
        let mut conn = lock(&self.sources, "add_sources")?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::store("add_sources", e))?;
        let mut stored = Vec::with_capacity(sources.len());
        for (offset, mut source) in sources.into_iter().enumerate() {
            source.id = Id(base + offset as u64);
            tx.execute(
                "INSERT INTO sources (id, name, type, format, location, args)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    source.id,
                    source.name,
                    source.kind.as_str(),
                    source.format,
                    source.location,
                    source.args
                ],
            )
            .map_err(|e| Error::store("add_sources", e))?;
            stored.push(source);
        }
        tx.commit().map_err(|e| Error::store("add_sources", e))?;
        Ok(stored)
    }

    pub fn delete_sources(&self, ids: &[Id]) -> Result<()> {
        let conn = lock(&self.sources, "delete_sources")?;
        for id in ids {
            conn.execute("DELETE FROM sources WHERE id = ?1", params![id])
                .map_err(|e| Error::store("delete_sources", e))?;
        }
        Ok(())
    }

    pub fn get_source(&self, id: Id) -> Result<Source> {
        let conn = lock(&self.sources, "get_source")?;
        conn.query_row(
            "SELECT id, name, type, format, location, args FROM sources WHERE id = ?1",
            params![id],
            row_to_source,
        )
        .optional()
        .map_err(|e| Error::store("get_source", e))?
        .ok_or_else(|| Error::not_found("source", id))
    }

    // --- hooks ---

    /// Hooks recorded against an object, oldest first.
    pub fn find_hooks(&self, object_id: Id) -> Result<Vec<Hook>> {
        let conn = lock(&self.conn, "find_hooks")?;
        let mut stmt = conn
            .prepare("SELECT id, object_id, node_id, done FROM hooks WHERE object_id = ?1 ORDER BY id")
            .map_err(|e| Error::store("find_hooks", e))?;
        let rows = stmt
            .query_map(params![object_id], |row| {
                Ok(Hook {
                    id: row.get(0)?,
                    object_id: row.get(1)?,
                    node_id: row.get(2)?,
                    done: row.get(3)?,
                })
            })
            .map_err(|e| Error::store("find_hooks", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store("find_hooks", e))
    }

    /// Creates or updates the unique `(object_id, node_id)` hook.
    pub fn record_hook(&self, object_id: Id, node_id: Id, done: bool) -> Result<()> {
        let conn = lock(&self.conn, "record_hook")?;
        conn.execute(
            "INSERT INTO hooks (object_id, node_id, done) VALUES (?1, ?2, ?3)
             ON CONFLICT(object_id, node_id) DO UPDATE SET done = excluded.done",
            params![object_id, node_id, done],
        )
        .map_err(|e| Error::store("record_hook", e))?;
        Ok(())
    }
}

fn parse_timestamp(text: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        ip: row.get(1)?,
        domain: row.get(2)?,
        fingerprints: Vec::new(),
        labels: Vec::new(),
        created_at: parse_timestamp(row.get(3)?),
    })
}

fn row_to_fingerprint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fingerprint> {
    Ok(Fingerprint {
        id: row.get(0)?,
        host_id: row.get(1)?,
        module_id: row.get(2)?,
        data: row.get(3)?,
        hash: row.get(4)?,
        service: row.get(5)?,
        protocol: row.get(6)?,
        port: row.get(7)?,
        created_at: parse_timestamp(row.get(8)?),
    })
}

fn row_to_label(row: &rusqlite::Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        host_id: row.get(1)?,
        short: row.get(2)?,
        long: row.get(3)?,
        description: row.get(4)?,
        mitigation: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?),
    })
}

fn row_to_scan(row: &rusqlite::Row<'_>) -> rusqlite::Result<Scan> {
    let targets: String = row.get(2)?;
    Ok(Scan {
        id: row.get(0)?,
        module_id: row.get(1)?,
        targets: serde_json::from_str(&targets).unwrap_or_default(),
        args: row.get(3)?,
        created_at: parse_timestamp(row.get(4)?),
    })
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    let kind: String = row.get(2)?;
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: SourceKind::parse(&kind).unwrap_or(SourceKind::File),
        format: row.get(3)?,
        location: row.get(4)?,
        args: row.get(5)?,
    })
}
