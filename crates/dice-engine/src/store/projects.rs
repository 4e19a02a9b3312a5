//! Persistence for projects and studies.

use std::sync::{Arc, Mutex};

use dice_core::error::{Error, Result};
use dice_core::model::{Id, Project, Study};
use rusqlite::{Connection, OptionalExtension, params};

use super::lock;

/// Store for `projects.db`.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProjectStore {
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS studies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                path TEXT NOT NULL
            );",
        )
    }

    /// Registers a project. A project at the same path is returned as-is;
    /// a different project under an already-used name is a duplicate.
    pub fn add_project(&self, project: &Project) -> Result<Project> {
        let conn = lock(&self.conn, "add_project")?;
        if let Some(existing) = conn
            .query_row(
                "SELECT id, name, path FROM projects WHERE path = ?1",
                params![project.path],
                row_to_project,
            )
            .optional()
            .map_err(|e| Error::store("add_project", e))?
        {
            return Ok(existing);
        }
        let name_taken: bool = conn
            .query_row(
                "SELECT 1 FROM projects WHERE name = ?1",
                params![project.name],
                |_| Ok(true),
            )
            .optional()
            .map_err(|e| Error::store("add_project", e))?
            .unwrap_or(false);
        if name_taken {
            return Err(Error::DuplicateName {
                kind: "project",
                name: project.name.clone(),
            });
        }

        conn.execute(
            "INSERT INTO projects (name, path) VALUES (?1, ?2)",
            params![project.name, project.path],
        )
        .map_err(|e| Error::store("add_project", e))?;
        let mut stored = project.clone();
        #[allow(clippy::cast_sign_loss)]
        {
            stored.id = Id(conn.last_insert_rowid() as u64);
        }
        Ok(stored)
    }

    pub fn project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let conn = lock(&self.conn, "get_project")?;
        conn.query_row(
            "SELECT id, name, path FROM projects WHERE name = ?1",
            params![name],
            row_to_project,
        )
        .optional()
        .map_err(|e| Error::store("get_project", e))
    }

    pub fn list_projects(&self, pattern: &str) -> Result<Vec<Project>> {
        let conn = lock(&self.conn, "list_projects")?;
        let mut stmt = conn
            .prepare("SELECT id, name, path FROM projects WHERE name GLOB ?1 ORDER BY id")
            .map_err(|e| Error::store("list_projects", e))?;
        let rows = stmt
            .query_map(params![pattern], row_to_project)
            .map_err(|e| Error::store("list_projects", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store("list_projects", e))
    }

    pub fn add_study(&self, study: &Study) -> Result<Study> {
        let conn = lock(&self.conn, "add_study")?;
        conn.execute(
            "INSERT INTO studies (project_id, name, path) VALUES (?1, ?2, ?3)",
            params![study.project_id, study.name, study.path],
        )
        .map_err(|e| Error::store("add_study", e))?;
        let mut stored = study.clone();
        #[allow(clippy::cast_sign_loss)]
        {
            stored.id = Id(conn.last_insert_rowid() as u64);
        }
        Ok(stored)
    }

    pub fn study_by_name(&self, project_id: Id, name: &str) -> Result<Option<Study>> {
        let conn = lock(&self.conn, "get_study")?;
        conn.query_row(
            "SELECT id, project_id, name, path FROM studies WHERE project_id = ?1 AND name = ?2",
            params![project_id, name],
            |row| {
                Ok(Study {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    path: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::store("get_study", e))
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn store() -> ProjectStore {
        let conn = open_in_memory().unwrap();
        ProjectStore::init_schema(&conn.lock().unwrap()).unwrap();
        ProjectStore::new(conn)
    }

    fn project(name: &str, path: &str) -> Project {
        Project {
            id: Id::ZERO,
            name: name.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_add_is_idempotent_on_path() {
        let store = store();
        let first = store.add_project(&project("coin", "/home/op/coin")).unwrap();
        let second = store.add_project(&project("coin", "/home/op/coin")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_projects("*").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_name_other_path() {
        let store = store();
        store.add_project(&project("coin", "/home/op/coin")).unwrap();
        let err = store
            .add_project(&project("coin", "/srv/elsewhere"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "project", .. }));
    }

    #[test]
    fn test_studies() {
        let store = store();
        let proj = store.add_project(&project("coin", "/home/op/coin")).unwrap();
        let study = store
            .add_study(&Study {
                id: Id::ZERO,
                project_id: proj.id,
                name: "sweep-1".to_string(),
                path: "/home/op/coin/sweep-1".to_string(),
            })
            .unwrap();
        let found = store.study_by_name(proj.id, "sweep-1").unwrap().unwrap();
        assert_eq!(found.id, study.id);
        assert!(store.study_by_name(proj.id, "missing").unwrap().is_none());
    }
}
