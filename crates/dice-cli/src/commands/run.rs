//! `dice scan` / `dice classify` - compose components and run.

use dice_core::config::{Config, PROJECT_MARKER, StandardPaths, UNSET, find_project_root};
use dice_core::error::{Error, Result};
use dice_core::model::{Id, Project, Source};
use dice_engine::{Actions, Engine};
use tracing::info;

use crate::RunArgs;

pub fn run(paths: &StandardPaths, args: &RunArgs, actions: Actions) -> Result<()> {
    paths.init()?;
    let mut config = Config::new(paths.clone());
    select_project(&mut config, args)?;

    let mut engine = Engine::open(config)?;
    engine.stage_modules(&args.modules)?;
    engine.stage_signatures(&args.signatures)?;
    engine.compose(actions)?;

    let mut sources = if args.sources.is_empty() {
        Vec::new()
    } else {
        engine.find_sources(&args.sources)?
    };
    if !args.targets.is_empty() {
        sources.push(Source::from_targets(&args.targets).map_err(|e| Error::Store {
            op: "encode_targets",
            message: e.to_string(),
        })?);
    }
    if sources.is_empty() {
        return Err(Error::not_found("source", "any (give targets or -s globs)"));
    }

    let result = engine.run(sources);
    engine.teardown();

    if result.is_ok() {
        let journal = engine.journal();
        info!(events = journal.len(), "run complete");
        println!("processed {} event(s)", journal.len());
    }
    result
}

/// Resolves `--project` / `--study` into the run configuration.
///
/// `-` discovers the enclosing project by walking up to a `.dice` marker;
/// `.` pins the current directory without registration; a name looks the
/// project up in the store.
fn select_project(config: &mut Config, args: &RunArgs) -> Result<()> {
    let store = dice_engine::store::open(&config.data_dir().join("projects.db"))?;
    dice_engine::store::ProjectStore::init_schema(&store.lock().expect("fresh connection"))
        .map_err(|e| Error::store("init_schema", e))?;
    let projects = dice_engine::store::ProjectStore::new(store);

    match args.project.as_str() {
        UNSET => {
            let cwd = std::env::current_dir()?;
            if let Some(root) = find_project_root(&cwd) {
                info!(root = %root.display(), "discovered project root");
                config.project = Some(Project {
                    id: Id::ZERO,
                    name: root
                        .file_name()
                        .and_then(|s| s.to_str())
                        .unwrap_or("project")
                        .to_string(),
                    path: root.to_string_lossy().into_owned(),
                });
            }
        }
        "." => {
            let cwd = std::env::current_dir()?;
            config.project = Some(Project {
                id: Id::ZERO,
                name: ".".to_string(),
                path: cwd.to_string_lossy().into_owned(),
            });
        }
        name => {
            let project = projects
                .project_by_name(name)?
                .ok_or_else(|| Error::not_found("project", name))?;
            config.project = Some(project);
        }
    }

    if args.study.as_str() != UNSET {
        let project = config
            .project
            .as_ref()
            .ok_or_else(|| Error::not_found("project", "any (studies need a project)"))?;
        let study = match projects.study_by_name(project.id, &args.study)? {
            Some(study) => study,
            None => {
                // First use of a study creates its directory on the fly.
                let path = std::path::Path::new(&project.path).join(&args.study);
                std::fs::create_dir_all(&path)?;
                projects.add_study(&dice_core::model::Study {
                    id: Id::ZERO,
                    project_id: project.id,
                    name: args.study.clone(),
                    path: path.to_string_lossy().into_owned(),
                })?
            }
        };
        config.study = Some(study);
    }

    // Named projects must carry the marker; discovered and ad-hoc ones
    // already proved theirs.
    if let Some(project) = &config.project {
        if project.id != Id::ZERO {
            let marker = std::path::Path::new(&project.path).join(PROJECT_MARKER);
            if !marker.exists() {
                return Err(Error::not_found("project marker", marker.display()));
            }
        }
    }
    Ok(())
}
