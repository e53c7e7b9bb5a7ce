//! uproot - residue-free uninstaller for Nimbus Sync
//!
//! A command-line utility that removes every trace of a Nimbus Sync
//! installation: the installer's registry keys and values in both the
//! all-users and current-user scopes, plus the install directory on disk.
//! The engine itself never closes a running instance; `uninstall
//! --close-app` runs a bounded close-and-retry loop before handing over.

use clap::{Parser, Subcommand};
use log::LevelFilter;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

mod engine;
mod identity;
mod install_path;
mod process_guard;
mod product;
mod regpath;
mod registry;

use engine::{Engine, ProgressFn, ResultFlags, UninstallReport};
use identity::Scope;
use install_path::InstallPathResolver;
use process_guard::{ProcessProbe, SystemProbe};
use product::TargetApp;
use registry::RegistryOps;

// Exit codes; `status` shares NOT_INSTALLED with `uninstall`.
const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_NOT_INSTALLED: i32 = 2;
const EXIT_APP_OPEN: i32 = 3;
// User declined the confirmation prompt; nothing was attempted.
const EXIT_ABORTED: i32 = 4;

/// The main CLI struct parsed by clap
#[derive(Parser)]
#[command(name = "uproot")]
#[command(version)]
#[command(about = "Residue-free uninstaller for Nimbus Sync", long_about = None)]
struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Extend the built-in identifier list from a newline-separated file
    #[arg(long, global = true, value_name = "FILE")]
    known_ids: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Report whether Nimbus Sync is installed, and where
    Status,

    /// Remove the installation from the registry and from disk
    Uninstall {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,

        /// Close a running Nimbus Sync instance before uninstalling
        #[arg(long)]
        close_app: bool,

        /// Close attempts before giving up (with --close-app)
        #[arg(long, default_value_t = 3, value_name = "N")]
        close_retries: u32,
    },
}

fn install_logger(debug: bool) -> anyhow::Result<()> {
    let filter = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = simplelog::ConfigBuilder::default()
        .set_target_level(LevelFilter::Debug)
        .build();
    TermLogger::init(filter, config, TerminalMode::Stderr, ColorChoice::Auto)?;
    if debug {
        log::warn!("Debug logging enabled");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = install_logger(cli.debug) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(EXIT_FAILED);
    }

    let mut app = TargetApp::nimbus_sync();
    if let Some(path) = &cli.known_ids {
        match File::open(path) {
            Ok(file) => match app.extend_known_ids(file) {
                Ok(added) => log::info!("Loaded {} identifier(s) from {}", added, path.display()),
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path.display(), e);
                    process::exit(EXIT_FAILED);
                }
            },
            Err(e) => {
                eprintln!("Failed to open {}: {}", path.display(), e);
                process::exit(EXIT_FAILED);
            }
        }
    }

    process::exit(dispatch(&cli, app));
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn dispatch(cli: &Cli, app: TargetApp) -> i32 {
            run(cli, app, registry::WindowsRegistry::new())
        }
    } else {
        fn dispatch(cli: &Cli, app: TargetApp) -> i32 {
            match &cli.command {
                // Status is harmless anywhere; it just never finds an
                // install.
                Commands::Status => run(cli, app, registry::MemRegistry::new()),
                Commands::Uninstall { .. } => {
                    eprintln!("uninstall modifies the Windows registry and only runs on Windows");
                    EXIT_FAILED
                }
            }
        }
    }
}

fn run<R: RegistryOps>(cli: &Cli, app: TargetApp, reg: R) -> i32 {
    let paths = InstallPathResolver::new(&app);
    match &cli.command {
        Commands::Status => {
            let engine = Engine::new(app, reg, SystemProbe::new(), paths);
            handle_status(cli, &engine)
        }
        Commands::Uninstall {
            yes,
            close_app,
            close_retries,
        } => {
            let engine = Engine::new(app, reg, SystemProbe::new(), paths);
            handle_uninstall(cli, engine, *yes, *close_app, *close_retries)
        }
    }
}

/// Installation status for `status --json`.
#[derive(serde::Serialize)]
struct StatusReport {
    installed: bool,
    machine_id: Option<String>,
    user_id: Option<String>,
    machine_path: Option<String>,
    user_path: Option<String>,
    running: bool,
}

fn handle_status<R: RegistryOps, P: ProcessProbe>(cli: &Cli, engine: &Engine<R, P>) -> i32 {
    let report = StatusReport {
        installed: engine.is_installed(),
        machine_id: engine.identifier(Scope::Machine).map(|id| id.to_string()),
        user_id: engine.identifier(Scope::User).map(|id| id.to_string()),
        machine_path: engine
            .install_path(Scope::Machine)
            .map(|p| p.display().to_string()),
        user_path: engine
            .install_path(Scope::User)
            .map(|p| p.display().to_string()),
        running: engine.guard().is_running(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else if report.installed {
        println!("Nimbus Sync is installed.");
        for (scope, id, path) in [
            ("All users", &report.machine_id, &report.machine_path),
            ("Current user", &report.user_id, &report.user_path),
        ] {
            if id.is_some() || path.is_some() {
                println!(
                    "  {}: id {}, path {}",
                    scope,
                    id.as_deref().unwrap_or("unknown"),
                    path.as_deref().unwrap_or("unknown")
                );
            }
        }
        if report.running {
            println!("  The application is currently running.");
        }
    } else {
        println!("Nimbus Sync is not installed.");
    }

    if report.installed {
        EXIT_OK
    } else {
        EXIT_NOT_INSTALLED
    }
}

fn handle_uninstall<R: RegistryOps, P: ProcessProbe>(
    cli: &Cli,
    engine: Engine<R, P>,
    yes: bool,
    close_app: bool,
    close_retries: u32,
) -> i32 {
    if !yes && !confirm("Remove Nimbus Sync and all of its data? [y/N] ") {
        println!("Aborted.");
        return EXIT_ABORTED;
    }

    // The engine never closes the application itself; the bounded retry
    // loop lives here, with the caller.
    if close_app && engine.guard().is_running() {
        log::info!("Closing running Nimbus Sync instance(s)");
        let mut closed = false;
        for attempt in 1..=close_retries.max(1) {
            if engine.guard().request_close() {
                closed = true;
                break;
            }
            log::warn!("Close attempt {} failed, retrying", attempt);
            thread::sleep(Duration::from_millis(500));
        }
        if !closed {
            eprintln!("Nimbus Sync is still running; uninstall not attempted.");
            return EXIT_APP_OPEN;
        }
    }

    let mut engine = engine;
    if !cli.json {
        let progress: ProgressFn = Box::new(|percent, message| {
            println!("[{:>3}%] {}", percent, message);
        });
        engine = engine.with_progress(progress);
    }

    let report = engine.uninstall();
    print_report(cli, &report);
    exit_code_for(&report)
}

fn print_report(cli: &Cli, report: &UninstallReport) {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(report).unwrap());
    } else {
        println!("\n{}", report);
    }
}

fn exit_code_for(report: &UninstallReport) -> i32 {
    if report.not_installed {
        EXIT_NOT_INSTALLED
    } else if report.flags.contains(ResultFlags::APPLICATION_OPEN) {
        EXIT_APP_OPEN
    } else if report.success() {
        EXIT_OK
    } else {
        EXIT_FAILED
    }
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let mut report = UninstallReport::default();
        assert_eq!(exit_code_for(&report), EXIT_OK);

        report.not_installed = true;
        assert_eq!(exit_code_for(&report), EXIT_NOT_INSTALLED);

        report.not_installed = false;
        report.flags.insert(ResultFlags::CANT_DELETE_KEY);
        assert_eq!(exit_code_for(&report), EXIT_FAILED);

        report.flags.insert(ResultFlags::APPLICATION_OPEN);
        assert_eq!(exit_code_for(&report), EXIT_APP_OPEN);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        // A declined prompt must be distinguishable from every engine
        // outcome in scripts.
        let codes = [
            EXIT_OK,
            EXIT_FAILED,
            EXIT_NOT_INSTALLED,
            EXIT_APP_OPEN,
            EXIT_ABORTED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
