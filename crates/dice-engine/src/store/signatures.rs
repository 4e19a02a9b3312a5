//! Persistence for signatures, modules, and their nodes.
//!
//! Staging a parsed signature resolves node names: module nodes against the
//! modules table, embedded nodes against the signatures table, and parent
//! lists against sibling nodes. Re-staging a signature that is already
//! stored is a no-op returning the stored form, which keeps node ids stable
//! across runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dice_core::error::{Error, Result};
use dice_core::model::{Id, Module, Node, NodeKind, Signature, Strategy};
use dice_core::model::ComponentKind;
use dice_core::parser::ParsedSignature;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::lock;

/// Store for `signatures.db`.
#[derive(Debug, Clone)]
pub struct SignatureStore {
    conn: Arc<Mutex<Connection>>,
}

impl SignatureStore {
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Creates the tables.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                component TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS modules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                location TEXT NOT NULL,
                hash TEXT NOT NULL,
                tags TEXT NOT NULL,
                properties TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature_id INTEGER NOT NULL REFERENCES signatures(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                object_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                args TEXT,
                position INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_signature ON nodes(signature_id);
            CREATE TABLE IF NOT EXISTS node_children (
                node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                child_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                UNIQUE(node_id, child_id)
            );",
        )
    }

    // --- modules ---

    /// Registers a module, returning the stored row. Idempotent on name.
    pub fn add_module(&self, module: &Module) -> Result<Module> {
        let conn = lock(&self.conn, "add_module")?;
        if let Some(existing) = Self::module_by_name_on(&conn, &module.name)? {
            return Ok(existing);
        }
        let tags =
            serde_json::to_string(&module.tags).map_err(|e| Error::store("add_module", e))?;
        let properties = serde_json::to_string(&module.properties)
            .map_err(|e| Error::store("add_module", e))?;
        conn.execute(
            "INSERT INTO modules (name, location, hash, tags, properties)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![module.name, module.location, module.hash, tags, properties],
        )
        .map_err(|e| Error::store("add_module", e))?;
        let mut stored = module.clone();
        #[allow(clippy::cast_sign_loss)]
        {
            stored.id = Id(conn.last_insert_rowid() as u64);
        }
        debug!(module = %stored.name, id = %stored.id, "module registered");
        Ok(stored)
    }

    pub fn get_module(&self, id: Id) -> Result<Module> {
        let conn = lock(&self.conn, "get_module")?;
        conn.query_row(
            "SELECT id, name, location, hash, tags, properties FROM modules WHERE id = ?1",
            params![id],
            row_to_module,
        )
        .optional()
        .map_err(|e| Error::store("get_module", e))?
        .ok_or_else(|| Error::not_found("module", id))
    }

    pub fn module_by_name(&self, name: &str) -> Result<Option<Module>> {
        let conn = lock(&self.conn, "get_module")?;
        Self::module_by_name_on(&conn, name)
    }

    fn module_by_name_on(conn: &Connection, name: &str) -> Result<Option<Module>> {
        conn.query_row(
            "SELECT id, name, location, hash, tags, properties FROM modules WHERE name = ?1",
            params![name],
            row_to_module,
        )
        .optional()
        .map_err(|e| Error::store("get_module", e))
    }

    /// Modules whose name matches the glob pattern (`*` matches all).
    pub fn list_modules(&self, pattern: &str) -> Result<Vec<Module>> {
        let conn = lock(&self.conn, "list_modules")?;
        let mut stmt = conn
            .prepare("SELECT id, name, location, hash, tags, properties FROM modules WHERE name GLOB ?1 ORDER BY id")
            .map_err(|e| Error::store("list_modules", e))?;
        let rows = stmt
            .query_map(params![pattern], row_to_module)
            .map_err(|e| Error::store("list_modules", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store("list_modules", e))
    }

    /// Deletes modules matching the glob; returns how many went away.
    pub fn remove_modules(&self, pattern: &str) -> Result<usize> {
        let conn = lock(&self.conn, "remove_modules")?;
        conn.execute("DELETE FROM modules WHERE name GLOB ?1", params![pattern])
            .map_err(|e| Error::store("remove_modules", e))
    }

    // --- signatures ---

    /// Stages one parsed signature. See [`Self::stage_all`].
    pub fn stage_parsed(&self, parsed: &ParsedSignature) -> Result<Signature> {
        let mut staged = self.stage_all(std::slice::from_ref(parsed))?;
        Ok(staged.remove(0))
    }

    /// Stages a batch of parsed signatures, resolving node and parent names.
    ///
    /// Staging is two-phase inside one transaction: first every new
    /// signature's header row, then each signature's nodes. Mutually
    /// embedding signatures therefore stage fine; the embedding cycle is
    /// the graph compiler's to reject. A signature already stored under a
    /// staged name is returned as-is: re-staging an identical set is a
    /// no-op with stable ids.
    pub fn stage_all(&self, parsed: &[ParsedSignature]) -> Result<Vec<Signature>> {
        let mut fresh: Vec<&ParsedSignature> = Vec::new();
        for p in parsed {
            if self.signature_by_name(&p.name)?.is_none()
                && !fresh.iter().any(|f| f.name == p.name)
            {
                fresh.push(p);
            }
        }

        if !fresh.is_empty() {
            let mut conn = lock(&self.conn, "stage_signature")?;
            let tx = conn
                .transaction()
                .map_err(|e| Error::store("stage_signature", e))?;

            for p in &fresh {
                tx.execute(
                    "INSERT INTO signatures (name, component) VALUES (?1, ?2)",
                    params![p.name, p.component.as_str()],
                )
                .map_err(|e| Error::store("stage_signature", e))?;
            }
            for p in &fresh {
                Self::stage_nodes_on(&tx, p)?;
            }
            tx.commit().map_err(|e| Error::store("stage_signature", e))?;
        }

        parsed
            .iter()
            .map(|p| {
                self.signature_by_name(&p.name)?
                    .ok_or_else(|| Error::not_found("signature", &p.name))
            })
            .collect()
    }

    /// Inserts one signature's nodes and child links; the header rows of
    /// every signature in the batch are already present.
    fn stage_nodes_on(tx: &Connection, parsed: &ParsedSignature) -> Result<()> {
        let signature_id: Id = tx
            .query_row(
                "SELECT id FROM signatures WHERE name = ?1",
                params![parsed.name],
                |row| row.get(0),
            )
            .map_err(|e| Error::store("stage_signature", e))?;

        let mut node_ids = Vec::with_capacity(parsed.nodes.len());
        for (position, stub) in parsed.nodes.iter().enumerate() {
            let object_id = match stub.kind {
                NodeKind::Module => Self::module_by_name_on(tx, &stub.name)?
                    .map(|m| m.id)
                    .ok_or_else(|| Error::UnresolvedReference {
                        signature: parsed.name.clone(),
                        name: stub.name.clone(),
                    })?,
                NodeKind::EmbeddedSignature => tx
                    .query_row(
                        "SELECT id FROM signatures WHERE name = ?1",
                        params![stub.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| Error::store("stage_signature", e))?
                    .ok_or_else(|| Error::UnresolvedReference {
                        signature: parsed.name.clone(),
                        name: stub.name.clone(),
                    })?,
            };
            tx.execute(
                "INSERT INTO nodes (signature_id, kind, object_id, name, strategy, args, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    signature_id,
                    kind_text(stub.kind),
                    object_id,
                    stub.name,
                    stub.strategy.as_str(),
                    stub.args,
                    position as i64,
                ],
            )
            .map_err(|e| Error::store("stage_signature", e))?;
            #[allow(clippy::cast_sign_loss)]
            node_ids.push(Id(tx.last_insert_rowid() as u64));
        }

        // Link children: a stub naming parents attaches itself as a child of
        // each named sibling of the right kind.
        let find = |kind: NodeKind, name: &str| -> Result<Id> {
            parsed
                .nodes
                .iter()
                .position(|s| s.kind == kind && s.name == name)
                .map(|idx| node_ids[idx])
                .ok_or_else(|| Error::UnresolvedReference {
                    signature: parsed.name.clone(),
                    name: name.to_string(),
                })
        };
        for (idx, stub) in parsed.nodes.iter().enumerate() {
            let child_id = node_ids[idx];
            let parents = stub
                .module_parents
                .iter()
                .map(|n| find(NodeKind::Module, n))
                .chain(
                    stub.signature_parents
                        .iter()
                        .map(|n| find(NodeKind::EmbeddedSignature, n)),
                );
            for (position, parent) in parents.enumerate() {
                let parent_id = parent?;
                tx.execute(
                    "INSERT OR IGNORE INTO node_children (node_id, child_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![parent_id, child_id, position as i64],
                )
                .map_err(|e| Error::store("stage_signature", e))?;
            }
        }

        debug!(signature = %parsed.name, id = %signature_id, "signature staged");
        Ok(())
    }

    pub fn get_signature(&self, id: Id) -> Result<Signature> {
        let conn = lock(&self.conn, "get_signature")?;
        let header = conn
            .query_row(
                "SELECT id, name, component FROM signatures WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Id>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::store("get_signature", e))?
            .ok_or_else(|| Error::not_found("signature", id))?;
        Self::hydrate(&conn, header)
    }

    pub fn signature_by_name(&self, name: &str) -> Result<Option<Signature>> {
        let conn = lock(&self.conn, "get_signature")?;
        let header = conn
            .query_row(
                "SELECT id, name, component FROM signatures WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, Id>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::store("get_signature", e))?;
        header.map(|h| Self::hydrate(&conn, h)).transpose()
    }

    /// Signatures whose name matches the glob pattern, fully hydrated.
    pub fn list_signatures(&self, pattern: &str) -> Result<Vec<Signature>> {
        let headers = {
            let conn = lock(&self.conn, "list_signatures")?;
            let mut stmt = conn
                .prepare("SELECT id, name, component FROM signatures WHERE name GLOB ?1 ORDER BY id")
                .map_err(|e| Error::store("list_signatures", e))?;
            let rows = stmt
                .query_map(params![pattern], |row| {
                    Ok((
                        row.get::<_, Id>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| Error::store("list_signatures", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::store("list_signatures", e))?
        };
        let conn = lock(&self.conn, "list_signatures")?;
        headers
            .into_iter()
            .map(|h| Self::hydrate(&conn, h))
            .collect()
    }

    pub fn remove_signatures(&self, pattern: &str) -> Result<usize> {
        let conn = lock(&self.conn, "remove_signatures")?;
        conn.execute("DELETE FROM signatures WHERE name GLOB ?1", params![pattern])
            .map_err(|e| Error::store("remove_signatures", e))
    }

    /// Roots of a signature: nodes that are not a child of any node in the
    /// same signature. The graph compiler answers the same question with an
    /// in-memory scan; the two must agree.
    pub fn roots(&self, signature_id: Id) -> Result<Vec<Node>> {
        let conn = lock(&self.conn, "signature_roots")?;
        let mut stmt = conn
            .prepare(
                "SELECT n.id, n.signature_id, n.kind, n.object_id, n.name, n.strategy, n.args
                 FROM nodes AS n
                 WHERE n.signature_id = ?1
                 AND NOT EXISTS (
                     SELECT 1
                     FROM node_children AS nc
                     JOIN nodes AS parent ON nc.node_id = parent.id
                     WHERE nc.child_id = n.id
                     AND parent.signature_id = n.signature_id
                 )
                 ORDER BY n.position",
            )
            .map_err(|e| Error::store("signature_roots", e))?;
        let rows = stmt
            .query_map(params![signature_id], row_to_node)
            .map_err(|e| Error::store("signature_roots", e))?;
        let mut roots = rows
            .collect::<rusqlite::Result<Vec<Node>>>()
            .map_err(|e| Error::store("signature_roots", e))?;
        for node in &mut roots {
            node.children = Self::children_of(&conn, node.id)?;
        }
        Ok(roots)
    }

    fn hydrate(conn: &Connection, header: (Id, String, String)) -> Result<Signature> {
        let (id, name, component) = header;
        let component = ComponentKind::parse(&component).ok_or_else(|| Error::Store {
            op: "get_signature",
            message: format!("invalid component '{component}' for signature {id}"),
        })?;

        let mut stmt = conn
            .prepare(
                "SELECT id, signature_id, kind, object_id, name, strategy, args
                 FROM nodes WHERE signature_id = ?1 ORDER BY position",
            )
            .map_err(|e| Error::store("get_signature", e))?;
        let rows = stmt
            .query_map(params![id], row_to_node)
            .map_err(|e| Error::store("get_signature", e))?;
        let mut nodes = rows
            .collect::<rusqlite::Result<Vec<Node>>>()
            .map_err(|e| Error::store("get_signature", e))?;
        for node in &mut nodes {
            node.children = Self::children_of(conn, node.id)?;
        }

        Ok(Signature {
            id,
            name,
            component,
            nodes,
        })
    }

    fn children_of(conn: &Connection, node_id: Id) -> Result<Vec<Id>> {
        let mut stmt = conn
            .prepare("SELECT child_id FROM node_children WHERE node_id = ?1 ORDER BY position, child_id")
            .map_err(|e| Error::store("get_signature", e))?;
        let rows = stmt
            .query_map(params![node_id], |row| row.get(0))
            .map_err(|e| Error::store("get_signature", e))?;
        rows.collect::<rusqlite::Result<Vec<Id>>>()
            .map_err(|e| Error::store("get_signature", e))
    }
}

const fn kind_text(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Module => "module",
        NodeKind::EmbeddedSignature => "signature",
    }
}

fn kind_from_text(text: &str) -> Option<NodeKind> {
    match text {
        "module" => Some(NodeKind::Module),
        "signature" => Some(NodeKind::EmbeddedSignature),
        _ => None,
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let kind: String = row.get(2)?;
    let strategy: String = row.get(5)?;
    Ok(Node {
        id: row.get(0)?,
        signature_id: row.get(1)?,
        kind: kind_from_text(&kind).unwrap_or(NodeKind::Module),
        object_id: row.get(3)?,
        children: Vec::new(),
        name: row.get(4)?,
        strategy: Strategy::parse(&strategy).unwrap_or_default(),
        args: row.get(6)?,
    })
}

fn row_to_module(row: &rusqlite::Row<'_>) -> rusqlite::Result<Module> {
    let tags: String = row.get(4)?;
    let properties: String = row.get(5)?;
    Ok(Module {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        hash: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        properties: serde_json::from_str(&properties).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;
    use dice_core::parser;
    use std::collections::BTreeMap;

    fn store() -> SignatureStore {
        let conn = open_in_memory().unwrap();
        SignatureStore::init_schema(&conn.lock().unwrap()).unwrap();
        SignatureStore::new(conn)
    }

    fn module(name: &str) -> Module {
        Module {
            id: Id::ZERO,
            name: name.to_string(),
            location: format!("/modules/{name}"),
            hash: "deadbeef".to_string(),
            tags: vec!["classifier".to_string()],
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_module_roundtrip() {
        let store = store();
        let stored = store.add_module(&module("banner")).unwrap();
        assert_ne!(stored.id, Id::ZERO);

        let fetched = store.get_module(stored.id).unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.tags, vec!["classifier"]);
    }

    #[test]
    fn test_module_add_idempotent() {
        let store = store();
        let first = store.add_module(&module("banner")).unwrap();
        let second = store.add_module(&module("banner")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_modules("*").unwrap().len(), 1);
    }

    #[test]
    fn test_stage_resolves_nodes_and_parents() {
        let store = store();
        store.add_module(&module("probe")).unwrap();
        store.add_module(&module("banner")).unwrap();

        let parsed = parser::parse(
            "sweep",
            "component = identifier\nmod probe\nmod banner (mod: probe)\n",
        )
        .unwrap();
        let sig = store.stage_parsed(&parsed).unwrap();

        assert_eq!(sig.nodes.len(), 2);
        let probe = &sig.nodes[0];
        let banner = &sig.nodes[1];
        assert_eq!(probe.children, vec![banner.id]);
        assert!(banner.children.is_empty());
        assert_eq!(
            probe.object_id,
            store.module_by_name("probe").unwrap().unwrap().id
        );
    }

    #[test]
    fn test_stage_idempotent() {
        let store = store();
        store.add_module(&module("probe")).unwrap();
        let parsed = parser::parse("solo", "component = identifier\nmod probe\n").unwrap();

        let first = store.stage_parsed(&parsed).unwrap();
        let second = store.stage_parsed(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_signatures("*").unwrap().len(), 1);
    }

    #[test]
    fn test_stage_unresolved_module() {
        let store = store();
        let parsed = parser::parse("broken", "mod ghost\n").unwrap();
        let err = store.stage_parsed(&parsed).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { ref name, .. } if name == "ghost"));
        // Nothing was half-written.
        assert!(store.list_signatures("*").unwrap().is_empty());
    }

    #[test]
    fn test_stage_embedded_signature() {
        let store = store();
        store.add_module(&module("inner-mod")).unwrap();
        store.add_module(&module("outer-mod")).unwrap();

        let inner = parser::parse("inner", "mod inner-mod\n").unwrap();
        store.stage_parsed(&inner).unwrap();

        let outer = parser::parse(
            "outer",
            "component = identifier\nmod outer-mod\nsig inner (mod: outer-mod)\n",
        )
        .unwrap();
        let sig = store.stage_parsed(&outer).unwrap();
        let embedded = &sig.nodes[1];
        assert_eq!(embedded.kind, NodeKind::EmbeddedSignature);
        assert_eq!(
            embedded.object_id,
            store.signature_by_name("inner").unwrap().unwrap().id
        );
    }

    #[test]
    fn test_sql_roots_match_in_memory_scan() {
        let store = store();
        for name in ["a", "b", "c"] {
            store.add_module(&module(name)).unwrap();
        }
        let parsed = parser::parse(
            "dag",
            "mod a\nmod b\nmod c (mod: a,b)\n",
        )
        .unwrap();
        let sig = store.stage_parsed(&parsed).unwrap();

        let sql_roots: Vec<Id> = store.roots(sig.id).unwrap().iter().map(|n| n.id).collect();
        let scan_roots: Vec<Id> = dice_core::graph::roots_of(&sig).iter().map(|n| n.id).collect();
        assert_eq!(sql_roots, scan_roots);
        assert_eq!(sql_roots.len(), 2);
    }

    #[test]
    fn test_stage_all_mutual_embedding() {
        // Mutually embedding signatures must stage; rejecting the cycle is
        // the graph compiler's job, not the store's.
        let store = store();
        let x = parser::parse("x", "sig y\n").unwrap();
        let y = parser::parse("y", "sig x\n").unwrap();

        let staged = store.stage_all(&[x, y]).unwrap();
        assert_eq!(staged.len(), 2);
        let x_id = staged[0].id;
        let y_id = staged[1].id;
        assert_eq!(staged[0].nodes[0].object_id, y_id);
        assert_eq!(staged[1].nodes[0].object_id, x_id);
    }

    #[test]
    fn test_remove_by_glob() {
        let store = store();
        store.add_module(&module("tcp-syn")).unwrap();
        store.add_module(&module("tcp-ack")).unwrap();
        store.add_module(&module("udp")).unwrap();

        assert_eq!(store.remove_modules("tcp-*").unwrap(), 2);
        let left = store.list_modules("*").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "udp");
    }
}
