//! dice - scanning and classification engine for network reconnaissance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dice_core::config::{PathOverrides, StandardPaths, UNSET};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// dice - scanning and classification engine
#[derive(Parser, Debug)]
#[command(name = "dice")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (`-` resolves via XDG_DATA_HOME)
    #[arg(long, default_value = UNSET)]
    data_dir: String,

    /// State directory (`-` resolves via XDG_STATE_HOME)
    #[arg(long, default_value = UNSET)]
    state_dir: String,

    /// Config directory (`-` resolves via XDG_CONFIG_HOME)
    #[arg(long, default_value = UNSET)]
    config_dir: String,

    /// Application name used in standard paths
    #[arg(long, default_value = UNSET)]
    app_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a DICE project in a directory
    Init {
        /// Project root (defaults to the current directory)
        path: Option<PathBuf>,

        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Manage signatures
    #[command(subcommand)]
    Signature(SignatureCommands),

    /// Manage modules
    #[command(subcommand)]
    Module(ModuleCommands),

    /// Manage projects
    #[command(subcommand)]
    Projects(ProjectCommands),

    /// Orchestrate a scan: identify, classify, and scan
    Scan(RunArgs),

    /// Classify previously collected results (no scanner)
    #[command(alias = "cls")]
    Classify(RunArgs),
}

#[derive(Subcommand, Debug)]
enum SignatureCommands {
    /// Parse and register signature files from the signatures directory
    Add {
        /// Name globs, `*`/`?` supported
        #[arg(default_values_t = [String::from("*")])]
        globs: Vec<String>,
    },
    /// Remove registered signatures
    Remove {
        #[arg(required = true)]
        globs: Vec<String>,
    },
    /// List registered signatures
    List {
        #[arg(default_values_t = [String::from("*")])]
        globs: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ModuleCommands {
    /// Hash and register module executables from the modules directory
    Add {
        #[arg(default_values_t = [String::from("*")])]
        globs: Vec<String>,
    },
    /// Remove registered modules
    Remove {
        #[arg(required = true)]
        globs: Vec<String>,
    },
    /// List registered modules
    List {
        #[arg(default_values_t = [String::from("*")])]
        globs: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// List registered projects
    List {
        #[arg(default_values_t = [String::from("*")])]
        globs: Vec<String>,
    },
}

/// Shared flags of `scan` and `classify`.
#[derive(clap::Args, Debug)]
pub(crate) struct RunArgs {
    /// Targets to seed the run with
    pub(crate) targets: Vec<String>,

    /// Signatures to load (default: all)
    #[arg(short = 'S', long = "signature", default_values_t = [String::from("*")])]
    pub(crate) signatures: Vec<String>,

    /// Bare modules to load as entry points
    #[arg(short = 'M', long = "module")]
    pub(crate) modules: Vec<String>,

    /// Source file globs under the workspace
    #[arg(short = 's', long = "source")]
    pub(crate) sources: Vec<String>,

    /// Project to run in (`-` uses the discovered project)
    #[arg(long, default_value = UNSET)]
    pub(crate) project: String,

    /// Study within the project (`-` means none)
    #[arg(long, default_value = UNSET)]
    pub(crate) study: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let paths = StandardPaths::resolve(&PathOverrides {
        app_name: cli.app_name.clone(),
        config_home: cli.config_dir.clone(),
        state_home: cli.state_dir.clone(),
        data_home: cli.data_dir.clone(),
    });

    let result = match cli.command {
        Commands::Init { path, name } => commands::init::run(&paths, path.as_deref(), name.as_deref()),
        Commands::Signature(cmd) => match cmd {
            SignatureCommands::Add { globs } => commands::signature::add(&paths, &globs),
            SignatureCommands::Remove { globs } => commands::signature::remove(&paths, &globs),
            SignatureCommands::List { globs } => commands::signature::list(&paths, &globs),
        },
        Commands::Module(cmd) => match cmd {
            ModuleCommands::Add { globs } => commands::module::add(&paths, &globs),
            ModuleCommands::Remove { globs } => commands::module::remove(&paths, &globs),
            ModuleCommands::List { globs } => commands::module::list(&paths, &globs),
        },
        Commands::Projects(cmd) => match cmd {
            ProjectCommands::List { globs } => commands::project::list(&paths, &globs),
        },
        Commands::Scan(args) => commands::run::run(&paths, &args, dice_engine::Actions::all()),
        Commands::Classify(args) => {
            commands::run::run(&paths, &args, dice_engine::Actions::classify_only())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("dice: {err}");
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_flags() {
        let cli = Cli::try_parse_from([
            "dice", "scan", "1.2.3.4", "-S", "sweep", "-M", "banner", "-s", "*.json",
            "--project", "coin",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan(args) => {
                assert_eq!(args.targets, vec!["1.2.3.4"]);
                assert_eq!(args.signatures, vec!["sweep"]);
                assert_eq!(args.modules, vec!["banner"]);
                assert_eq!(args.sources, vec!["*.json"]);
                assert_eq!(args.project, "coin");
                assert_eq!(args.study, UNSET);
            }
            other => panic!("expected scan, got {other:?}"),
        }
    }

    #[test]
    fn test_signatures_default_to_all() {
        let cli = Cli::try_parse_from(["dice", "scan", "10.0.0.1"]).unwrap();
        match cli.command {
            Commands::Scan(args) => assert_eq!(args.signatures, vec!["*"]),
            other => panic!("expected scan, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_alias() {
        let cli = Cli::try_parse_from(["dice", "cls", "10.0.0.1"]).unwrap();
        assert!(matches!(cli.command, Commands::Classify(_)));
    }

    #[test]
    fn test_signature_list_defaults() {
        let cli = Cli::try_parse_from(["dice", "signature", "list"]).unwrap();
        match cli.command {
            Commands::Signature(SignatureCommands::List { globs }) => {
                assert_eq!(globs, vec!["*"]);
            }
            other => panic!("expected signature list, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_requires_globs() {
        assert!(Cli::try_parse_from(["dice", "module", "remove"]).is_err());
    }
}
