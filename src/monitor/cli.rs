use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use nix::sys::signal::{SigHandler, Signal};

use crate::monitor::log::{log_msg, Severity};
use crate::monitor::{build_info, daemon, log, watcher};

#[derive(Debug, Parser)]
#[command(name = "fdbmonitor", version, about = "FoundationDB process monitor")]
pub struct Args {
    /// The path of the configuration file enumerating the processes to
    /// supervise.
    #[arg(long = "conffile", default_value = "/etc/foundationdb/foundationdb.conf")]
    pub conffile: PathBuf,

    /// The path of the mutual exclusion file for this instance of
    /// fdbmonitor.
    #[arg(long = "lockfile", default_value = "/var/run/fdbmonitor.pid")]
    pub lockfile: PathBuf,

    /// Background the fdbmonitor process and log to syslog.
    #[arg(long = "daemonize")]
    pub daemonize: bool,
}

pub fn run() -> anyhow::Result<()> {
    // `-?` is accepted as a help alias but is not expressible as a clap
    // short flag; rewrite it before parsing.
    let argv: Vec<OsString> = std::env::args_os()
        .map(|arg| if arg == "-?" { OsString::from("--help") } else { arg })
        .collect();

    let args = match Args::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    log::init(args.daemonize);
    log_msg(Severity::Info, format!("Started {}", build_info::banner()));

    // Resolve and verify the configuration path while errors still reach
    // the terminal.
    let conffile = watcher::absolute_path(&args.conffile)?;
    if std::fs::canonicalize(&conffile).is_err() {
        log_msg(Severity::Err, format!("No configuration file at {}", conffile.display()));
        std::process::exit(1);
    }

    if args.daemonize {
        daemonize()?;
    }

    // One thread of control: every event source is multiplexed by the
    // supervision loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    if let Err(e) = runtime.block_on(daemon::run(&conffile, &args.lockfile)) {
        log_msg(Severity::Err, format!("{e:#}"));
        std::process::exit(1);
    }

    Ok(())
}

/// Detach from the controlling terminal. Must run before the runtime is
/// built; fork does not carry worker threads across.
fn daemonize() -> anyhow::Result<()> {
    nix::unistd::daemon(false, false).context("daemon")?;
    for sig in [Signal::SIGTSTP, Signal::SIGTTOU, Signal::SIGTTIN] {
        let _ = unsafe { nix::sys::signal::signal(sig, SigHandler::SigIgn) };
    }
    Ok(())
}
