use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use fs2::FileExt as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time::Instant;

use crate::monitor::command::monotonic_now;
use crate::monitor::config::MonitorIdentity;
use crate::monitor::ini::IniDocument;
use crate::monitor::launcher;
use crate::monitor::log::{log_err, log_msg, Severity};
use crate::monitor::pipes::OutputPipes;
use crate::monitor::reconcile::{self, PlannedAction, ReconcilePlan};
use crate::monitor::table::ProcessTable;
use crate::monitor::watcher::{ConfEvent, ConfWatcher};

/// Starts that are waiting out a restart delay. The event loop sleeps until
/// the earliest deadline; a reconcile pass that kills or replaces an
/// instance cancels its pending entry.
#[derive(Debug, Default)]
pub struct PendingStarts {
    entries: Vec<(Instant, u64)>,
}

impl PendingStarts {
    pub fn schedule(&mut self, id: u64, delay_secs: u32) {
        self.cancel(id);
        self.entries
            .push((Instant::now() + Duration::from_secs(delay_secs as u64), id));
    }

    pub fn cancel(&mut self, id: u64) {
        self.entries.retain(|(_, pending)| *pending != id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(at, _)| *at).min()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<u64> {
        let mut due: Vec<(Instant, u64)> = Vec::new();
        self.entries.retain(|(at, id)| {
            if *at <= now {
                due.push((*at, *id));
                false
            } else {
                true
            }
        });
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_scheduled(&self, id: u64) -> bool {
        self.entries.iter().any(|(_, pending)| *pending == id)
    }
}

/// Everything the event loop owns: the process table, the registered output
/// pipes, the pending-start queue, and the identity children run as.
pub struct Monitor {
    lockfile: PathBuf,
    // Held for the process lifetime; the advisory lock dies with it.
    _lock: File,
    identity: MonitorIdentity,
    child_mask: SigSet,
    table: ProcessTable,
    pipes: OutputPipes,
    pending: PendingStarts,
}

/// Acquire the advisory lock, write our pid, and run the supervision loop
/// until SIGINT or SIGTERM. An `Err` return is an unrecoverable error the
/// caller turns into exit status 1.
pub async fn run(conffile: &Path, lockfile: &Path) -> anyhow::Result<()> {
    let Some(lock) = acquire_lock(lockfile)? else {
        log_msg(
            Severity::Err,
            format!(
                "Unable to lock fdbmonitor lockfile {} (is fdbmonitor already running?)",
                lockfile.display()
            ),
        );
        // Another instance owns this configuration; not an error.
        return Ok(());
    };

    nix::unistd::chdir("/").context("Unable to change working directory")?;

    let mut watcher = ConfWatcher::new(conffile)?;

    // Streams must exist before the first child is spawned so no SIGCHLD is
    // delivered with default disposition.
    let mut sighup = unix_signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut sigint = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigchld = unix_signal(SignalKind::child()).context("install SIGCHLD handler")?;

    let mut monitor = Monitor {
        lockfile: lockfile.to_path_buf(),
        _lock: lock,
        identity: MonitorIdentity::current(),
        child_mask: SigSet::empty(),
        table: ProcessTable::new(),
        pipes: OutputPipes::new(),
        pending: PendingStarts::default(),
    };

    reload(&mut monitor, watcher.canonical_path());

    enum LoopEvent {
        Exit(&'static str),
        Hangup,
        ChildExited,
        PipeReady(usize),
        Conf(ConfEvent),
        StartDue,
    }

    loop {
        let next_deadline = monitor.pending.next_deadline();

        // Within one iteration: exit signals first, then reaping, then pipe
        // draining, then filesystem events, then due restarts.
        let event = tokio::select! {
            biased;
            _ = sigint.recv() => LoopEvent::Exit("SIGINT"),
            _ = sigterm.recv() => LoopEvent::Exit("SIGTERM"),
            _ = sighup.recv() => LoopEvent::Hangup,
            _ = sigchld.recv() => LoopEvent::ChildExited,
            idx = monitor.pipes.next_ready() => LoopEvent::PipeReady(idx),
            conf = watcher.next_event() => LoopEvent::Conf(conf),
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() => LoopEvent::StartDue,
        };

        match event {
            LoopEvent::Exit(name) => {
                shutdown(&monitor, name);
                return Ok(());
            }
            LoopEvent::Hangup => {
                log_msg(Severity::Info, "Received signal SIGHUP, doing nothing");
            }
            LoopEvent::ChildExited => reap_children(&mut monitor),
            LoopEvent::PipeReady(idx) => monitor.pipes.drain(idx).await,
            LoopEvent::Conf(kind) => {
                let swapped = kind == ConfEvent::PathSwapped;
                match watcher.reinstall(swapped) {
                    Ok(true) => reload(&mut monitor, watcher.canonical_path()),
                    Ok(false) => {}
                    Err(e) => return Err(e),
                }
            }
            LoopEvent::StartDue => {
                for id in monitor.pending.take_due(Instant::now()) {
                    launch(&mut monitor, id);
                }
            }
        }
    }
}

/// Create the lock file's parent directory, open it, and take the advisory
/// lock. `Ok(None)` means another fdbmonitor already holds it.
fn acquire_lock(lockfile: &Path) -> anyhow::Result<Option<File>> {
    let parent = lockfile.parent().filter(|p| !p.as_os_str().is_empty()).with_context(|| {
        format!(
            "Unable to determine parent directory of lockfile {}",
            lockfile.display()
        )
    })?;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(parent)
        .with_context(|| {
            format!("Unable to create parent directory for lockfile {}", lockfile.display())
        })?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o640)
        .open(lockfile)
        .with_context(|| format!("Unable to open fdbmonitor lockfile {}", lockfile.display()))?;

    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }

    // Record our pid for operators; the lock itself is what enforces mutual
    // exclusion.
    file.set_len(0)
        .and_then(|()| writeln!(file, "{}", std::process::id()))
        .with_context(|| format!("Unable to write pid to lockfile {}", lockfile.display()))?;

    Ok(Some(file))
}

/// Parse the configuration and reconcile the running set against it. Parse
/// and identity failures abandon the reload and leave everything running.
fn reload(monitor: &mut Monitor, confpath: &Path) {
    log_msg(Severity::Info, format!("Loading configuration {}", confpath.display()));

    let ini = match IniDocument::load(confpath) {
        Ok(doc) => doc,
        Err(e) => {
            log_err(
                "read",
                &e,
                format!("Unable to load configuration file {}", confpath.display()),
            );
            return;
        }
    };

    let plan = match reconcile::plan(&ini, &monitor.table, monitor.identity) {
        Ok(plan) => plan,
        Err(e) => {
            log_msg(Severity::Err, format!("{e:#}"));
            return;
        }
    };

    apply_plan(monitor, plan);
}

fn apply_plan(monitor: &mut Monitor, plan: ReconcilePlan) {
    monitor.identity = plan.identity;

    for id in &plan.identity_kills {
        kill_process(monitor, *id);
        destroy_command(monitor, *id);
    }

    for action in plan.actions {
        match action {
            PlannedAction::MarkDeconfigured { id } => {
                if let Some(cmd) = monitor.table.command_mut(id) {
                    log_msg(Severity::Info, format!("Deconfigured {}", cmd.ssection));
                    cmd.deconfigured = true;
                }
            }
            PlannedAction::KillDeconfigured { id } => {
                if let Some(cmd) = monitor.table.command(id) {
                    log_msg(Severity::Info, format!("Deconfigured {}", cmd.ssection));
                }
                kill_process(monitor, id);
                destroy_command(monitor, id);
            }
            PlannedAction::Replace { id, mut cmd, restart } => {
                log_msg(
                    Severity::Info,
                    format!("Found new configuration for {}", cmd.ssection),
                );
                if restart {
                    kill_process(monitor, id);
                }
                attach_pipes(monitor, &mut cmd);
                if let Some(old) = monitor.table.replace_command(cmd) {
                    if let Some(pipes) = old.pipes {
                        monitor.pipes.unregister(pipes.token);
                    }
                }
                if restart {
                    schedule_start(monitor, id, 0);
                }
            }
            PlannedAction::UpdateOptions { id, cmd } => {
                if let Some(existing) = monitor.table.command_mut(id) {
                    log_msg(
                        Severity::Info,
                        format!("Updated configuration for {}", existing.ssection),
                    );
                    existing.update_options_from(&cmd);
                }
            }
            PlannedAction::Start { id, mut cmd } => {
                log_msg(Severity::Info, format!("Starting {}", cmd.ssection));
                monitor.pending.cancel(id);
                attach_pipes(monitor, &mut cmd);
                if let Some(old) = monitor.table.replace_command(cmd) {
                    if let Some(pipes) = old.pipes {
                        monitor.pipes.unregister(pipes.token);
                    }
                }
                schedule_start(monitor, id, 0);
            }
        }
    }
}

fn attach_pipes(monitor: &mut Monitor, cmd: &mut crate::monitor::command::Command) {
    match monitor.pipes.register(&cmd.ssection) {
        Ok(pipes) => cmd.pipes = Some(pipes),
        Err(e) => {
            log_msg(
                Severity::Err,
                format!("Unable to construct pipe for {}: {e:#}", cmd.ssection),
            );
        }
    }
}

/// Synchronous termination: SIGTERM, then wait for that specific pid.
/// Signals queued for other children stay queued and are handled by the
/// loop afterwards.
fn kill_process(monitor: &mut Monitor, id: u64) {
    monitor.pending.cancel(id);
    let Some(pid) = monitor.table.pid_of(id) else {
        return;
    };

    log_msg(Severity::Info, format!("Killing process {pid}"));
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }

    monitor.table.remove_pid(pid);
}

fn destroy_command(monitor: &mut Monitor, id: u64) {
    monitor.pending.cancel(id);
    if let Some(cmd) = monitor.table.remove_command(id) {
        if let Some(pipes) = cmd.pipes {
            monitor.pipes.unregister(pipes.token);
        }
    }
}

/// Drain every terminated child without blocking, routing each through the
/// restart (or destruction) policy.
fn reap_children(monitor: &mut Monitor) {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some(pid) = status.pid() else {
                    break;
                };
                handle_exit(monitor, pid.as_raw(), status);
            }
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log_err(
                    "waitpid",
                    &std::io::Error::from(e),
                    "Error while waiting for child process",
                );
                break;
            }
        }
    }
}

fn handle_exit(monitor: &mut Monitor, pid: libc::pid_t, status: WaitStatus) {
    let Some(id) = monitor.table.remove_pid(pid) else {
        // Not one of ours (or already accounted for by a synchronous kill).
        return;
    };

    let deconfigured = monitor
        .table
        .command(id)
        .map(|cmd| cmd.deconfigured)
        .unwrap_or(true);
    if deconfigured {
        destroy_command(monitor, id);
        return;
    }

    let (delay, quiet, ssection) = {
        let Some(cmd) = monitor.table.command_mut(id) else {
            return;
        };
        let mut rng = rand::thread_rng();
        let delay = cmd.next_restart_delay(monotonic_now(), &mut rng);
        (delay, cmd.quiet, cmd.ssection.clone())
    };

    if !quiet {
        match status {
            WaitStatus::Exited(_, code) => {
                let severity = if code == 0 { Severity::Notice } else { Severity::Err };
                log_msg(
                    severity,
                    format!("Process {pid} exited {code}, restarting {ssection} in {delay} seconds"),
                );
            }
            WaitStatus::Signaled(_, sig, _) => {
                log_msg(
                    Severity::Notice,
                    format!(
                        "Process {pid} terminated by signal {sig}, restarting {ssection} in {delay} seconds"
                    ),
                );
            }
            _ => {
                log_msg(
                    Severity::Warning,
                    format!(
                        "Process {pid} exited for unknown reason, restarting {ssection} in {delay} seconds"
                    ),
                );
            }
        }
    }

    schedule_start(monitor, id, delay);
}

/// Record the scheduled start time and either launch now or queue for the
/// timer. `last_start` is the scheduled time, not the fork time, so the
/// reset interval measures from when the child was meant to begin.
fn schedule_start(monitor: &mut Monitor, id: u64, delay_secs: u32) {
    if let Some(cmd) = monitor.table.command_mut(id) {
        cmd.last_start = monotonic_now() + delay_secs as f64;
    }
    if delay_secs == 0 {
        launch(monitor, id);
    } else {
        monitor.pending.schedule(id, delay_secs);
    }
}

fn launch(monitor: &mut Monitor, id: u64) {
    if monitor.table.is_running(id) {
        return;
    }
    let launched = {
        let Some(cmd) = monitor.table.command(id) else {
            return;
        };
        launcher::start_process(cmd, monitor.identity, monitor.child_mask)
    };

    match launched {
        Some(pid) => monitor.table.record_start(id, pid),
        None => {
            // Spawn failures are retried under the normal restart-delay
            // policy; un-launchable Commands wait for the next reload.
            let Some(cmd) = monitor.table.command_mut(id) else {
                return;
            };
            if !cmd.launchable() {
                return;
            }
            let mut rng = rand::thread_rng();
            let delay = cmd.next_restart_delay(monotonic_now(), &mut rng).max(1);
            cmd.last_start = monotonic_now() + delay as f64;
            monitor.pending.schedule(id, delay);
        }
    }
}

/// Clean exit: SIGHUP the whole process group, wait until every child is
/// reaped, then remove the lock file.
fn shutdown(monitor: &Monitor, signal_name: &str) {
    log_msg(
        Severity::Notice,
        format!("Received signal {signal_name}, shutting down"),
    );

    let _ = kill(Pid::from_raw(0), Signal::SIGHUP);

    loop {
        match nix::sys::wait::wait() {
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }

    let _ = std::fs::remove_file(&monitor.lockfile);
}
