use std::os::unix::process::CommandExt as _;
use std::process::Stdio;

use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{getegid, geteuid, Gid, Uid};

use crate::monitor::command::Command;
use crate::monitor::config::{MonitorIdentity, SCRUBBED_ENV_VARS};
use crate::monitor::log::{log_err, log_msg, Severity};

/// Launch the child for a Command, redirecting its stdout/stderr into the
/// Command's pipes and switching it to the monitor's configured identity.
///
/// Child-side setup runs between fork and exec:
/// 1. restore default dispositions for the signals the monitor handles
/// 2. restore the inherited signal mask
/// 3. arrange for SIGHUP on parent death, re-armed after any uid change
///    (setuid resets the parent-death signal), exiting early if the monitor
///    is already gone
/// 4. switch gid, then uid, when they differ from the current ones
///
/// Returns the child's pid, or `None` when the Command is not launchable or
/// the spawn failed. Spawn failures are logged; the Command stays in the
/// table and is retried under the normal restart-delay policy.
pub fn start_process(cmd: &Command, identity: MonitorIdentity, child_mask: SigSet) -> Option<libc::pid_t> {
    if !cmd.launchable() {
        return None;
    }
    let Some(pipes) = cmd.pipes.as_ref() else {
        log_msg(
            Severity::Err,
            format!("No output pipes for {}, not launching", cmd.ssection),
        );
        return None;
    };

    let stdout = match pipes.stdout_write.try_clone() {
        Ok(fd) => fd,
        Err(e) => {
            log_err("dup", &e, format!("Unable to redirect stdout for {}", cmd.ssection));
            return None;
        }
    };
    let stderr = match pipes.stderr_write.try_clone() {
        Ok(fd) => fd,
        Err(e) => {
            log_err("dup", &e, format!("Unable to redirect stderr for {}", cmd.ssection));
            return None;
        }
    };

    let mut child = std::process::Command::new(&cmd.argv[0]);
    child.args(&cmd.argv[1..]);
    child.stdout(Stdio::from(stdout));
    child.stderr(Stdio::from(stderr));
    if cmd.delete_wd40_env {
        for var in SCRUBBED_ENV_VARS {
            child.env_remove(var);
        }
    }

    let uid = identity.uid;
    let gid = identity.gid;
    unsafe {
        child.pre_exec(move || {
            // Drop the parent's handler dispositions before anything that
            // could raise one of these.
            for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
                let _ = unsafe { nix::sys::signal::signal(sig, SigHandler::SigDfl) };
            }

            nix::sys::signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&child_mask), None)
                .map_err(std::io::Error::from)?;

            // Parent death raises SIGHUP. If the monitor died between fork
            // and here, we were reparented to init already.
            if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if nix::unistd::getppid().as_raw() == 1 {
                unsafe { libc::_exit(0) };
            }

            if getegid().as_raw() != gid {
                nix::unistd::setgid(Gid::from_raw(gid)).map_err(std::io::Error::from)?;
            }
            if geteuid().as_raw() != uid {
                nix::unistd::setuid(Uid::from_raw(uid)).map_err(std::io::Error::from)?;
            }

            // Setting uid/gid resets the parent-death signal; arm it again.
            if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if nix::unistd::getppid().as_raw() == 1 {
                unsafe { libc::_exit(0) };
            }

            Ok(())
        });
    }

    match child.spawn() {
        Ok(proc) => {
            let pid = proc.id() as libc::pid_t;
            if !cmd.quiet {
                log_msg(
                    Severity::Info,
                    format!("Launching {} ({}) for {}", cmd.argv[0], pid, cmd.ssection),
                );
            }
            // The monitor reaps through waitpid, not through this handle.
            drop(proc);
            Some(pid)
        }
        Err(e) => {
            log_err(
                "execv",
                &e,
                format!("Failed to launch {} for {}", cmd.argv[0], cmd.ssection),
            );
            None
        }
    }
}
