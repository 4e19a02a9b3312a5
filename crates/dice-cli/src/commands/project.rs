//! `dice projects` - list registered projects.

use dice_core::config::StandardPaths;
use dice_core::error::Result;

use super::open_engine;

pub fn list(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    for glob in globs {
        for project in engine.project_store().list_projects(glob)? {
            println!("{} {}", project.name, project.path);
        }
    }
    Ok(())
}
