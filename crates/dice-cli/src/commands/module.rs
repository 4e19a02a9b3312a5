//! `dice module` - manage registered modules.

use dice_core::config::StandardPaths;
use dice_core::error::Result;
use dice_engine::loader;

use super::open_engine;

pub fn add(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    let dir = engine.config().modules_dir();
    let modules = loader::find_module_files(&dir, globs)?;
    if modules.is_empty() {
        println!("no module files match under {}", dir.display());
        return Ok(());
    }
    for module in modules {
        let stored = engine.signature_store().add_module(&module)?;
        println!(
            "{} [{}] {}",
            stored.name,
            stored.tags.join(","),
            &stored.hash[..12.min(stored.hash.len())]
        );
    }
    Ok(())
}

pub fn remove(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    let mut removed = 0;
    for glob in globs {
        removed += engine.signature_store().remove_modules(glob)?;
    }
    println!("removed {removed} module(s)");
    Ok(())
}

pub fn list(paths: &StandardPaths, globs: &[String]) -> Result<()> {
    let engine = open_engine(paths)?;
    for glob in globs {
        for module in engine.signature_store().list_modules(glob)? {
            println!(
                "{} [{}] {}",
                module.name,
                module.tags.join(","),
                module.location
            );
        }
    }
    Ok(())
}
