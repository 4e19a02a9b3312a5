//! Command implementations.

pub mod init;
pub mod module;
pub mod project;
pub mod run;
pub mod signature;

use dice_core::config::{Config, StandardPaths};
use dice_core::error::Result;
use dice_engine::Engine;

/// Opens an engine with no project selection, for management commands.
pub(crate) fn open_engine(paths: &StandardPaths) -> Result<Engine> {
    paths.init()?;
    Engine::open(Config::new(paths.clone()))
}
