//! `dice init` - mark a directory as a project root.

use std::path::Path;

use dice_core::config::StandardPaths;
use dice_core::error::Result;

use super::open_engine;

pub fn run(paths: &StandardPaths, path: Option<&Path>, name: Option<&str>) -> Result<()> {
    let engine = open_engine(paths)?;
    let project = engine.init_project(path.unwrap_or_else(|| Path::new(".")), name)?;
    println!(
        "DICE project \"{}\" initialized in \"{}\"",
        project.name, project.path
    );
    Ok(())
}
