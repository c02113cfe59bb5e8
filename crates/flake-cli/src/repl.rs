//! REPL – Read-Eval-Print Loop for the flake interactive shell.
//!
//! Supported slash-commands:
//!   /help                    – show this list
//!   /ps                      – list processes
//!   /spawn <name> [priority] – start a demo worker with a heartbeat watchdog
//!   /kill <pid>              – terminate a process, delete its watchdog, free its resources
//!   /suspend <pid>           – suspend a process and pause its watchdog
//!   /resume <pid>            – resume a process and re-arm its watchdog
//!   /watchdogs               – list watchdog tokens
//!   /timers                  – list timers
//!   /resources               – list registered resources
//!   /mem                     – allocator statistics per pool
//!   /panic                   – most recent escalation
//!   /status                  – JSON snapshot of the whole kernel
//!   /quit | /exit            – gracefully exit the shell

use colored::Colorize;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flake_kernel::{Kernel, event};
use flake_types::{
    EventKind, KernelResult, MemoryKind, Pid, Priority, ResourceKind, WatchdogId, WatchdogKind,
};
use tracing::{debug, warn};

use crate::config::Config;

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Ps,
    Spawn { name: String, priority: Priority },
    Kill(Pid),
    Suspend(Pid),
    Resume(Pid),
    Watchdogs,
    Timers,
    Resources,
    Mem,
    Panic,
    Status,
    Quit,
}

/// Parse one input line.  Errors are user-facing messages.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let pid_arg = |usage: &str| -> Result<Pid, String> {
        match args.as_slice() {
            [pid] => pid.parse::<Pid>().map_err(|e| e.to_string()),
            _ => Err(format!("usage: {usage} <pid>")),
        }
    };

    match head {
        "/help" => Ok(Command::Help),
        "/ps" => Ok(Command::Ps),
        "/spawn" => match args.as_slice() {
            [name] => Ok(Command::Spawn {
                name: (*name).to_string(),
                priority: Priority::Normal,
            }),
            [name, priority] => Ok(Command::Spawn {
                name: (*name).to_string(),
                priority: priority.parse().map_err(|e: flake_types::KernelError| e.to_string())?,
            }),
            _ => Err("usage: /spawn <name> [idle|low|normal|high|critical]".to_string()),
        },
        "/kill" => pid_arg("/kill").map(Command::Kill),
        "/suspend" => pid_arg("/suspend").map(Command::Suspend),
        "/resume" => pid_arg("/resume").map(Command::Resume),
        "/watchdogs" => Ok(Command::Watchdogs),
        "/timers" => Ok(Command::Timers),
        "/resources" => Ok(Command::Resources),
        "/mem" => Ok(Command::Mem),
        "/panic" => Ok(Command::Panic),
        "/status" => Ok(Command::Status),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command '{other}'")),
    }
}

/// Shell state: the kernel plus the watchdog owned by each demo worker.
pub struct Shell<'a> {
    kernel: &'a Kernel,
    cfg: &'a Config,
    heartbeats: HashMap<Pid, WatchdogId>,
}

impl<'a> Shell<'a> {
    pub fn new(kernel: &'a Kernel, cfg: &'a Config) -> Self {
        Self {
            kernel,
            cfg,
            heartbeats: HashMap::new(),
        }
    }

    /// Start a worker that registers a `<name>-buf` memory region and then
    /// feeds a `<name>-hb` watchdog every heartbeat interval until it is
    /// terminated.
    pub fn spawn_worker(&mut self, name: &str, priority: Priority) -> KernelResult<(Pid, WatchdogId)> {
        let watchdogs = self.kernel.watchdogs();
        let wd = watchdogs.create(
            &format!("{name}-hb"),
            WatchdogKind::Task,
            Duration::from_millis(self.cfg.heartbeat_timeout_ms),
        )?;
        let feeder = match watchdogs.feeder(wd) {
            Ok(feeder) => feeder,
            Err(e) => {
                let _ = watchdogs.delete(wd);
                return Err(e);
            }
        };

        let processes = self.kernel.processes().clone();
        let resources = self.kernel.resources().clone();
        let buffer = format!("{name}-buf");
        let interval = Duration::from_millis(self.cfg.heartbeat_interval_ms);
        let created = self.kernel.processes().create(
            name,
            move || {
                if let Err(e) = resources.register(&buffer, ResourceKind::MemoryRegion, false) {
                    warn!(error = %e, "worker could not register its buffer");
                }
                while feeder.feed().is_ok() {
                    processes.yield_now(interval);
                }
                debug!("heartbeat watchdog gone, worker exiting");
            },
            self.cfg.default_stack_size,
            priority,
        );

        match created {
            Ok(pid) => {
                self.heartbeats.insert(pid, wd);
                self.publish(event::PROCESS_CREATED, pid);
                Ok((pid, wd))
            }
            Err(e) => {
                let _ = watchdogs.delete(wd);
                Err(e)
            }
        }
    }

    /// Terminate `pid`, release every resource it owns, then delete the
    /// watchdog it was feeding.
    pub fn kill(&mut self, pid: Pid) -> KernelResult<()> {
        self.kernel.processes().terminate(pid)?;
        let freed = self.kernel.resources().cleanup_for_process(pid);
        if freed > 0 {
            debug!(pid = %pid, freed, "released resources of terminated process");
        }
        if let Some(wd) = self.heartbeats.remove(&pid)
            && let Err(e) = self.kernel.watchdogs().delete(wd)
        {
            warn!(pid = %pid, error = %e, "heartbeat watchdog already gone");
        }
        self.publish(event::PROCESS_TERMINATED, pid);
        Ok(())
    }

    fn publish(&self, name: &str, pid: Pid) {
        if let Err(e) = self.kernel.events().publish(name, EventKind::System, &pid.0.to_le_bytes()) {
            warn!(event = name, pid = %pid, error = %e, "lifecycle event dropped");
        }
    }

    /// Suspend `pid` and pause its watchdog so the silence is not escalated.
    pub fn suspend(&mut self, pid: Pid) -> KernelResult<()> {
        self.kernel.processes().suspend(pid)?;
        if let Some(wd) = self.heartbeats.get(&pid) {
            self.kernel.watchdogs().set_active(*wd, false)?;
        }
        Ok(())
    }

    pub fn resume(&mut self, pid: Pid) -> KernelResult<()> {
        self.kernel.processes().resume(pid)?;
        if let Some(wd) = self.heartbeats.get(&pid) {
            self.kernel.watchdogs().set_active(*wd, true)?;
        }
        Ok(())
    }

    /// Terminate every demo worker.  Used on exit.
    pub fn kill_all(&mut self) {
        let pids: Vec<Pid> = self.heartbeats.keys().copied().collect();
        for pid in pids {
            if let Err(e) = self.kill(pid) {
                warn!(pid = %pid, error = %e, "failed to terminate worker on exit");
            }
        }
    }

    /// JSON snapshot of the kernel.
    pub fn status(&self) -> serde_json::Value {
        let kernel = self.kernel;
        let allocator = kernel.allocator();
        let memory: serde_json::Map<String, serde_json::Value> = MemoryKind::ALL
            .iter()
            .map(|kind| {
                (
                    kind.to_string(),
                    serde_json::to_value(allocator.stats(*kind)).unwrap_or_default(),
                )
            })
            .collect();

        serde_json::json!({
            "state": kernel.state(),
            "uptime_ms": kernel.uptime().as_millis() as u64,
            "ticks": kernel.tick_count(),
            "processes": kernel.processes().list(),
            "watchdogs": kernel.watchdogs().list(),
            "timers": kernel.timers().list(),
            "queues": kernel.queues().list(),
            "subscriptions": kernel.events().subscriptions(),
            "pending_events": kernel.events().pending(),
            "resources": kernel.resources().list(),
            "memory": memory,
            "panics": kernel.panic_handler().count(),
            "last_panic": kernel.panic_handler().last_info().ok(),
        })
    }

    fn execute(&mut self, command: Command) {
        let outcome = match command {
            Command::Help => {
                cmd_help();
                Ok(())
            }
            Command::Ps => {
                self.cmd_ps();
                Ok(())
            }
            Command::Spawn { name, priority } => self.spawn_worker(&name, priority).map(|(pid, wd)| {
                println!(
                    "{} process {} ({}) with watchdog {}",
                    "✓ Spawned".green(),
                    pid.to_string().bold(),
                    name,
                    wd
                )
            }),
            Command::Kill(pid) => self
                .kill(pid)
                .map(|()| println!("{} process {}", "✓ Terminated".green(), pid)),
            Command::Suspend(pid) => self
                .suspend(pid)
                .map(|()| println!("{} process {}", "✓ Suspended".green(), pid)),
            Command::Resume(pid) => self
                .resume(pid)
                .map(|()| println!("{} process {}", "✓ Resumed".green(), pid)),
            Command::Watchdogs => {
                self.cmd_watchdogs();
                Ok(())
            }
            Command::Timers => {
                self.cmd_timers();
                Ok(())
            }
            Command::Resources => {
                self.cmd_resources();
                Ok(())
            }
            Command::Mem => {
                self.cmd_mem();
                Ok(())
            }
            Command::Panic => {
                self.cmd_panic();
                Ok(())
            }
            Command::Status => {
                match serde_json::to_string_pretty(&self.status()) {
                    Ok(json) => println!("{json}"),
                    Err(e) => println!("{}: {}", "Serialization error".red(), e),
                }
                Ok(())
            }
            Command::Quit => Ok(()),
        };

        if let Err(e) = outcome {
            println!("{} {} (code {})", "Error:".red(), e, e.code());
        }
    }

    fn cmd_ps(&self) {
        println!("{}", "Processes".bold().underline());
        println!("  {:>4}  {:<16} {:<11} {:<9} {:>7} {:>8}", "PID", "NAME", "STATE", "PRIORITY", "STACK", "CPU");
        for p in self.kernel.processes().list() {
            println!(
                "  {:>4}  {:<16} {:<11} {:<9} {:>7} {:>8}",
                p.pid, p.name, p.state, p.priority, p.stack_size, p.cpu_time
            );
        }
    }

    fn cmd_watchdogs(&self) {
        let now = self.kernel.uptime();
        println!("{}", "Watchdogs".bold().underline());
        for w in self.kernel.watchdogs().list() {
            let idle = now.saturating_sub(w.last_feed);
            let health = if !w.active {
                "paused".dimmed()
            } else if idle >= w.timeout {
                "STARVED".red().bold()
            } else {
                "ok".green()
            };
            println!(
                "  {:>3}  {:<20} {:<9} timeout {:>6} ms  idle {:>6} ms  {}",
                w.id,
                w.name,
                w.kind,
                w.timeout.as_millis(),
                idle.as_millis(),
                health
            );
        }
    }

    fn cmd_timers(&self) {
        println!("{}", "Timers".bold().underline());
        for t in self.kernel.timers().list() {
            println!(
                "  {:>3}  every {:>6} ms  {:<9} next at {:>8} ms  {}",
                t.id,
                t.interval.as_millis(),
                if t.periodic { "periodic" } else { "one-shot" },
                t.next_trigger.as_millis(),
                if t.active { "active".green() } else { "stopped".dimmed() }
            );
        }
    }

    fn cmd_resources(&self) {
        println!("{}", "Resources".bold().underline());
        for r in self.kernel.resources().list() {
            let owner = r.owner.map_or_else(|| "-".to_string(), |pid| pid.to_string());
            println!(
                "  {:>3}  {:<20} {:<20} owner {:>4}  refs {:>3}  {}",
                r.id,
                r.name,
                r.kind.to_string(),
                owner,
                r.ref_count,
                if r.shareable { "shared" } else { "exclusive" }
            );
        }
    }

    fn cmd_mem(&self) {
        println!("{}", "Memory".bold().underline());
        for kind in MemoryKind::ALL {
            let s = self.kernel.allocator().stats(kind);
            println!(
                "  {:<9} used {:>8} / {:>8}  peak {:>8}  allocs {:>5}  frees {:>5}",
                kind.to_string(),
                s.used,
                s.total,
                s.peak,
                s.allocations,
                s.deallocations
            );
        }
    }

    fn cmd_panic(&self) {
        match self.kernel.panic_handler().last_info() {
            Ok(info) => println!(
                "  {} {} from '{}' at {} (uptime {} ms, {} total)",
                "Last panic:".red().bold(),
                info.reason,
                info.message,
                info.timestamp.to_rfc3339(),
                info.uptime.as_millis(),
                self.kernel.panic_handler().count()
            ),
            Err(_) => println!("  {}", "No panic recorded.".green()),
        }
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
/// Demo workers still running on exit are terminated.
pub fn run(kernel: &Kernel, cfg: &Config, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut shell = Shell::new(kernel, cfg);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "flake>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        match parse_command(cmd) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => shell.execute(command),
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }

    shell.kill_all();
}

fn cmd_help() {
    println!();
    println!("{}", "flake Commands".bold().underline());
    println!("  {}                    – list processes", "/ps".bold().cyan());
    println!("  {} – start a demo worker", "/spawn <name> [priority]".bold().cyan());
    println!("  {}              – terminate a process", "/kill <pid>".bold().cyan());
    println!("  {}           – suspend a process", "/suspend <pid>".bold().cyan());
    println!("  {}            – resume a process", "/resume <pid>".bold().cyan());
    println!("  {}             – list watchdog tokens", "/watchdogs".bold().cyan());
    println!("  {}                – list timers", "/timers".bold().cyan());
    println!("  {}             – list registered resources", "/resources".bold().cyan());
    println!("  {}                   – memory pool statistics", "/mem".bold().cyan());
    println!("  {}                 – last escalation", "/panic".bold().cyan());
    println!("  {}                – JSON snapshot", "/status".bold().cyan());
    println!("  {}           – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use flake_kernel::KernelConfig;
    use flake_types::{KernelError, ProcessState};
    use std::time::Instant;

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn test_config() -> Config {
        Config {
            heartbeat_interval_ms: 5,
            heartbeat_timeout_ms: 10_000,
            ..Config::default()
        }
    }

    #[test]
    fn parses_spawn_with_and_without_priority() {
        assert_eq!(
            parse_command("/spawn Worker").unwrap(),
            Command::Spawn {
                name: "Worker".to_string(),
                priority: Priority::Normal
            }
        );
        assert_eq!(
            parse_command("/spawn Worker HIGH").unwrap(),
            Command::Spawn {
                name: "Worker".to_string(),
                priority: Priority::High
            }
        );
        assert!(parse_command("/spawn Worker urgent").is_err());
        assert!(parse_command("/spawn").is_err());
    }

    #[test]
    fn parses_pid_commands() {
        assert_eq!(parse_command("/kill 3").unwrap(), Command::Kill(Pid(3)));
        assert_eq!(parse_command("  /suspend   7 ").unwrap(), Command::Suspend(Pid(7)));
        assert_eq!(parse_command("/resume 1").unwrap(), Command::Resume(Pid(1)));
        assert!(parse_command("/kill").is_err());
        assert!(parse_command("/kill abc").is_err());
        assert!(parse_command("/kill 1 2").is_err());
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("/ps").unwrap(), Command::Ps);
        assert_eq!(parse_command("/exit").unwrap(), Command::Quit);
        assert_eq!(parse_command("/status").unwrap(), Command::Status);
        assert_eq!(parse_command("/resources").unwrap(), Command::Resources);
        assert!(parse_command("/reboot").is_err());
    }

    #[test]
    fn spawned_worker_feeds_its_watchdog_and_kill_cleans_up() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cfg = test_config();
        let mut shell = Shell::new(&kernel, &cfg);

        let (pid, wd) = shell.spawn_worker("Worker", Priority::Normal).unwrap();
        assert_eq!(kernel.watchdogs().get(wd).unwrap().name, "Worker-hb");
        assert!(wait_for(|| kernel.processes().get(pid).unwrap().state == ProcessState::Running));
        assert!(wait_for(|| !kernel.watchdogs().get(wd).unwrap().last_feed.is_zero()));

        shell.kill(pid).unwrap();
        assert!(kernel.processes().is_empty());
        assert!(kernel.watchdogs().is_empty());
        assert!(matches!(shell.kill(pid), Err(KernelError::NotFound(_))));
    }

    #[test]
    fn kill_releases_the_workers_resources() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cfg = test_config();
        let mut shell = Shell::new(&kernel, &cfg);
        let (worker, _) = shell.spawn_worker("Owner", Priority::Normal).unwrap();
        let (bystander, _) = shell.spawn_worker("Other", Priority::Normal).unwrap();

        let owned_by = |name: &str| {
            kernel
                .resources()
                .find_by_name(name)
                .and_then(|id| kernel.resources().get(id))
                .map(|r| r.owner)
        };
        assert!(wait_for(|| owned_by("Owner-buf") == Ok(Some(worker))));
        assert!(wait_for(|| owned_by("Other-buf") == Ok(Some(bystander))));

        shell.kill(worker).unwrap();
        assert!(matches!(
            kernel.resources().find_by_name("Owner-buf"),
            Err(KernelError::NotFound(_))
        ));
        assert_eq!(owned_by("Other-buf"), Ok(Some(bystander)));

        shell.kill_all();
        assert!(kernel.resources().is_empty());
    }

    #[test]
    fn lifecycle_events_reach_subscribers() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cfg = test_config();
        let mut shell = Shell::new(&kernel, &cfg);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in [event::PROCESS_CREATED, event::PROCESS_TERMINATED] {
            let seen = Arc::clone(&seen);
            kernel
                .events()
                .subscribe(name, move |e| seen.lock().unwrap().push((e.name.clone(), e.data.clone())))
                .unwrap();
        }

        let (pid, _) = shell.spawn_worker("Noisy", Priority::Low).unwrap();
        shell.kill(pid).unwrap();
        kernel.tick();

        let bytes = pid.0.to_le_bytes().to_vec();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (event::PROCESS_CREATED.to_string(), bytes.clone()),
                (event::PROCESS_TERMINATED.to_string(), bytes),
            ]
        );
    }

    #[test]
    fn suspend_pauses_the_heartbeat_watchdog() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cfg = test_config();
        let mut shell = Shell::new(&kernel, &cfg);
        let (pid, wd) = shell.spawn_worker("Sleeper", Priority::Low).unwrap();

        shell.suspend(pid).unwrap();
        assert!(!kernel.watchdogs().get(wd).unwrap().active);
        assert_eq!(kernel.processes().get(pid).unwrap().state, ProcessState::Blocked);

        shell.resume(pid).unwrap();
        assert!(kernel.watchdogs().get(wd).unwrap().active);
        shell.kill_all();
        assert!(kernel.processes().is_empty());
    }

    #[test]
    fn status_snapshot_has_every_section() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cfg = test_config();
        let shell = Shell::new(&kernel, &cfg);
        let status = shell.status();
        for key in [
            "state",
            "uptime_ms",
            "ticks",
            "processes",
            "watchdogs",
            "timers",
            "queues",
            "subscriptions",
            "pending_events",
            "resources",
            "memory",
            "last_panic",
        ] {
            assert!(status.get(key).is_some(), "missing {key}");
        }
        assert_eq!(status["state"], "initializing");
        assert!(status["memory"].get("internal").is_some());
        assert!(status["last_panic"].is_null());
    }
}
