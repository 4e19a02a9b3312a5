//! `dice signature` - manage registered signatures.

use dice_core::config::StandardPaths;
use dice_core::error::Result;
use dice_engine::loader;

use super::open_engine;

pub fn add(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    let dir = engine.config().signatures_dir();
    let files = loader::find_signature_files(&dir, globs)?;
    if files.is_empty() {
        println!("no signature files match under {}", dir.display());
        return Ok(());
    }
    for path in files {
        let sig = engine.stage_signature_file(&path)?;
        println!("{} [{}] ({} nodes)", sig.name, sig.component, sig.nodes.len());
    }
    Ok(())
}

pub fn remove(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    let mut removed = 0;
    for glob in globs {
        removed += engine.signature_store().remove_signatures(glob)?;
    }
    println!("removed {removed} signature(s)");
    Ok(())
}

pub fn list(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    let store = engine.signature_store();
    for glob in globs {
        for sig in store.list_signatures(glob)? {
            let roots = store.roots(sig.id)?;
            let names: Vec<&str> = roots.iter().map(|n| n.name.as_str()).collect();
            println!(
                "{} [{}] nodes: {} roots: {}",
                sig.name,
                sig.component,
                sig.nodes.len(),
                names.join(",")
            );
        }
    }
    Ok(())
}
