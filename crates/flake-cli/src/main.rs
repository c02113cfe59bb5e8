//! `flake-cli` – interactive shell for the flake kernel control plane.
//!
//! This binary:
//!
//! 1. Loads `~/.flake/config.toml`, writing the defaults on first run.
//! 2. Boots the kernel (process, watchdog and timer registries plus the tick
//!    orchestrator) and registers a one-second uptime timer.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/spawn`, `/ps`, `/kill`, `/watchdogs`, `/status`, `/help`, ...).
//! 4. Intercepts **Ctrl-C** to stop the orchestrator and exit cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use flake_kernel::Kernel;
use flake_kernel::clock::Clock;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter (default "info"); FLAKE_LOG_FORMAT=json
    // emits newline-delimited JSON.  User-facing output still uses println!.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("FLAKE_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Kernel boot ───────────────────────────────────────────────────────
    let kernel = match Kernel::new(cfg.kernel.clone()) {
        Ok(kernel) => Arc::new(kernel),
        Err(e) => {
            println!("{}: {}", "Invalid kernel configuration".red(), e);
            std::process::exit(1);
        }
    };

    let clock = Arc::clone(kernel.clock());
    match kernel.timers().create(
        Duration::from_secs(1),
        move || debug!(uptime_ms = clock.now().as_millis() as u64, "uptime"),
        true,
    ) {
        Ok(id) => {
            if let Err(e) = kernel.timers().start(id) {
                warn!(error = %e, "failed to start uptime timer");
            }
        }
        Err(e) => warn!(error = %e, "failed to create uptime timer"),
    }

    if let Err(e) = kernel.start() {
        println!("{}: {}", "Kernel failed to start".red(), e);
        std::process::exit(1);
    }
    println!(
        "  Kernel {} (tick {} ms, sweep bound {} ms)",
        "running".green(),
        cfg.kernel.tick_period_ms,
        cfg.kernel.sweep_lock_bound_ms
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let kernel_for_ctrlc = Arc::clone(&kernel);

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);

        if stop_kernel(&kernel_for_ctrlc) == 0 {
            println!("{}", "  ✓ Kernel stopped.".green());
        } else {
            println!("{}", "  Kernel stopped with errors (see log).".yellow());
        }
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&kernel, &cfg, shutdown);

    if let Err(e) = kernel.shutdown() {
        warn!(error = %e, "kernel shutdown");
    }
}

/// Terminate every process and stop the orchestrator.  Failures are logged;
/// returns how many steps failed.
fn stop_kernel(kernel: &Kernel) -> usize {
    let mut failures = 0;
    for p in kernel.processes().list() {
        if let Err(e) = kernel.processes().terminate(p.pid) {
            warn!(pid = %p.pid, error = %e, "failed to terminate process on shutdown");
            failures += 1;
        }
    }
    if let Err(e) = kernel.shutdown() {
        warn!(error = %e, "kernel shutdown");
        failures += 1;
    }
    failures
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ______      __       "#.bold().cyan());
    println!("{}", r#"   / __/ /___ _/ /_____  "#.bold().cyan());
    println!("{}", r#"  / /_/ / __ `/ //_/ _ \ "#.bold().cyan());
    println!("{}", r#" / __/ / /_/ / ,< /  __/ "#.bold().cyan());
    println!("{}", r#"/_/ /_/\__,_/_/|_|\___/  "#.bold().cyan());
    println!();
    println!("  {} {}",
        "flake".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Kernel control plane shell");
    println!();
}
