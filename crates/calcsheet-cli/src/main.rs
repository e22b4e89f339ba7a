//! CalcSheet CLI - The `calcsheet` command.
//!
//! Headless driver for the CalcSheet engine: loads a `.csheet`
//! worksheet, builds it into a native model library, runs it, and prints
//! engine notifications. The GUI application drives the same engine
//! through the same observer interface.

mod format;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use calcsheet_codegen::GeneratorService;
use calcsheet_core::document::DocumentRegistry;
use calcsheet_core::engine::{ExecState, ExecutionEngine};
use calcsheet_core::loader::LibraryLoader;
use calcsheet_core::notify::Notification;

/// CalcSheet - scientific worksheet build & execute engine
#[derive(Parser, Debug)]
#[command(name = "calcsheet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and run CalcSheet worksheets", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build and run a .csheet worksheet
    Run {
        /// Path to the worksheet to execute
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Build with debug instrumentation
        #[arg(short, long)]
        debug: bool,

        /// Single-step through operations, printing values at each stop
        #[arg(long)]
        step: bool,

        /// Watch the file and rerun on change
        #[arg(short, long)]
        watch: bool,

        /// Directory for build artifacts (default: a temp directory)
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Run {
            file,
            debug,
            step,
            watch,
            out_dir,
        } => run_worksheet(file, debug, step, watch, out_dir),
        Commands::Version => {
            println!("calcsheet {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Part of the CalcSheet project");
            println!("A scientific worksheet authoring application");
            println!();
            println!("Modular Architecture:");
            println!("  - calcsheet-core:    document model and build/execute engine");
            println!("  - calcsheet-codegen: worksheet-to-C++ translation and toolchain");
            Ok(())
        }
    }
}

fn run_worksheet(
    file: PathBuf,
    debug: bool,
    step: bool,
    watch: bool,
    out_dir: Option<PathBuf>,
) -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    if file.extension().and_then(|s| s.to_str()) != Some("csheet") {
        log::warn!("File doesn't have .csheet extension");
    }

    println!("CalcSheet - worksheet engine");
    println!("============================\n");
    println!("Loading: {}\n", file.display());

    let registry = DocumentRegistry::new();
    let doc = format::load_worksheet(&registry, &file)
        .with_context(|| format!("Failed to load {}", file.display()))?;

    let out_dir = out_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("calcsheet-build-{}", std::process::id()))
    });

    log::info!("1. Starting code generator...");
    let generator = GeneratorService::new(registry.clone())
        .context("Failed to start the code generator")?;

    log::info!("2. Creating execution engine...");
    let mut engine = ExecutionEngine::new(
        registry.clone(),
        Box::new(generator),
        Box::new(LibraryLoader::new()),
        out_dir,
    );

    // Observer state shared with the main loop. The observer runs on the
    // controller thread (inside process_pending), but Ctrl-C handling
    // needs atomics anyway, so everything uses them.
    let finished = Arc::new(AtomicBool::new(false));
    let paused = Arc::new(AtomicBool::new(false));
    let rejected = Arc::new(AtomicBool::new(false));
    {
        let finished = finished.clone();
        let paused = paused.clone();
        let rejected = rejected.clone();
        engine.subscribe(move |notification| {
            print_notification(notification);
            match notification {
                Notification::Stopped { .. }
                | Notification::Aborted { .. }
                | Notification::NowShutdown => finished.store(true, Ordering::SeqCst),
                Notification::PausedOnUserRequest { .. }
                | Notification::PausedAtBreakpoint { .. }
                | Notification::PausedOnVariableUpdate { .. } => {
                    paused.store(true, Ordering::SeqCst)
                }
                Notification::DirectoryReadOnly { .. } => {
                    rejected.store(true, Ordering::SeqCst)
                }
                _ => {}
            }
        });
    }

    // First Ctrl-C aborts the run; the second forces shutdown.
    let interrupts = Arc::new(AtomicU32::new(0));
    {
        let interrupts = interrupts.clone();
        ctrlc::set_handler(move || {
            let count = interrupts.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= 3 {
                std::process::exit(130);
            }
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    log::info!("3. Requesting run...");
    if step {
        engine.step(&doc);
    } else {
        engine.run(&doc, debug, None);
    }

    let mut handled_interrupts = 0;
    let mut last_progress = (0u64, 0u64);
    let mut last_modified = modified_time(&file);
    let mut rerun_after_abort = false;
    // An accepted request leaves the engine active; coming to rest
    // without a Stopped/Aborted means the request failed.
    let mut was_active = true;
    let mut run_error = None;
    let interval = Duration::from_millis(1);

    loop {
        engine.process_pending();

        let seen = interrupts.load(Ordering::SeqCst);
        while handled_interrupts < seen {
            handled_interrupts += 1;
            match handled_interrupts {
                1 => {
                    eprintln!("\nInterrupted; aborting run (Ctrl-C again to force shutdown)");
                    engine.abort();
                }
                _ => {
                    engine.shutdown_now();
                }
            }
        }

        if engine.state() == ExecState::Building {
            let progress = engine.translation_progress().read();
            if progress != last_progress && progress.1 > 0 {
                log::debug!("translating {}/{}", progress.0, progress.1);
                last_progress = progress;
            }
        }

        if paused.swap(false, Ordering::SeqCst) {
            // Headless: keep the model moving.
            if step {
                engine.step(&doc);
            } else {
                engine.resume(None);
            }
        }

        if watch {
            let modified = modified_time(&file);
            if modified != last_modified {
                last_modified = modified;
                println!("\nFile changed, reloading...");
                match format::reload_worksheet(&registry, &doc, &file) {
                    Ok(()) => {
                        engine.root_element_changed(doc.id());
                        if engine.state().is_active() {
                            engine.abort();
                            rerun_after_abort = true;
                        } else {
                            finished.store(false, Ordering::SeqCst);
                            engine.run(&doc, debug, None);
                        }
                    }
                    Err(err) => eprintln!("Reload failed: {:#}", err),
                }
            }
        }

        if finished.swap(false, Ordering::SeqCst) {
            was_active = false;
            if engine.is_shut_down() {
                break;
            }
            if rerun_after_abort {
                rerun_after_abort = false;
                engine.run(&doc, debug, None);
            } else if !watch {
                break;
            }
        }

        if rejected.swap(false, Ordering::SeqCst) && !watch {
            run_error = Some("build directory is not writable");
            break;
        }
        if engine.state().is_active() {
            was_active = true;
        } else if was_active {
            // At rest without a Stopped/Aborted: the build failed. The
            // diagnostics have already been printed by the observer.
            was_active = false;
            if !watch {
                run_error = Some("build failed");
                break;
            }
        }

        std::thread::sleep(interval);
    }

    engine.shutdown_now();
    engine.process_pending();
    if let Some(message) = run_error {
        anyhow::bail!("{}", message);
    }
    println!("\nDone.");
    Ok(())
}

fn modified_time(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::Running { root, debug } => {
            log::info!("running {} (debug={})", root, debug);
        }
        Notification::Stopped { root } => {
            println!("finished: {}", root);
        }
        Notification::Aborted { root } => {
            println!("aborted: {}", root);
        }
        Notification::Resumed { .. } => {
            log::debug!("resumed");
        }
        Notification::PausedOnUserRequest { element, changed, .. }
        | Notification::PausedAtBreakpoint { element, changed, .. } => {
            match element {
                Some(el) => println!("paused at {}", el),
                None => println!("paused"),
            }
            for value in changed {
                println!("    {} = {}", value.name, value.value);
            }
        }
        Notification::PausedOnVariableUpdate {
            element,
            identifier,
            ..
        } => {
            match element {
                Some(el) => println!("paused at {} (watch)", el),
                None => println!("paused (watch)"),
            }
            println!("    {} = {}", identifier.name, identifier.value);
        }
        Notification::OutputToDevice { device, value } => {
            println!("[{}] {}", device, value);
        }
        Notification::DiagnosticsReported { diagnostics, .. } => {
            for diagnostic in diagnostics {
                eprintln!("{}", diagnostic);
            }
        }
        Notification::DirectoryReadOnly { path } => {
            eprintln!("error: build directory {} is read-only", path.display());
        }
        Notification::Ready(ready) => log::debug!("ready={}", ready),
        Notification::Active(active) => log::debug!("active={}", active),
        Notification::NowShutdown => log::info!("engine shut down"),
    }
}
