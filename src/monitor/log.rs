use std::ffi::CString;
use std::sync::OnceLock;

use chrono::Local;

/// Message severities, mapped onto syslog priorities when daemonized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Notice,
    Warning,
    Err,
}

impl Severity {
    fn syslog_priority(self) -> libc::c_int {
        match self {
            Severity::Info => libc::LOG_INFO,
            Severity::Notice => libc::LOG_NOTICE,
            Severity::Warning => libc::LOG_WARNING,
            Severity::Err => libc::LOG_ERR,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sink {
    Stderr,
    Syslog,
}

static SINK: OnceLock<Sink> = OnceLock::new();

/// Install the process-wide log sink. When `daemonize` is set, lines go to
/// syslog with facility DAEMON and tag `fdbmonitor`; otherwise they go to
/// stderr prefixed with a local timestamp. First call wins.
pub fn init(daemonize: bool) {
    if daemonize {
        // The ident passed to openlog must stay valid for the process
        // lifetime, hence the static.
        static IDENT: &[u8] = b"fdbmonitor\0";
        unsafe {
            libc::openlog(
                IDENT.as_ptr() as *const libc::c_char,
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            );
        }
        let _ = SINK.set(Sink::Syslog);
    } else {
        let _ = SINK.set(Sink::Stderr);
    }
}

pub fn log_msg(severity: Severity, msg: impl AsRef<str>) {
    let msg = msg.as_ref();
    match SINK.get().copied().unwrap_or(Sink::Stderr) {
        Sink::Stderr => {
            let now = Local::now();
            eprintln!(
                "{} ({}.{:06}): {}",
                now.format("%Z %Y-%m-%d %H:%M:%S%.6f"),
                now.timestamp(),
                now.timestamp_subsec_micros(),
                msg
            );
        }
        Sink::Syslog => {
            // syslog(3) is printf-style; pass the message through "%s" so
            // user-controlled content cannot act as a format string.
            let c = CString::new(msg.replace('\0', " ")).unwrap_or_default();
            unsafe {
                libc::syslog(
                    severity.syslog_priority(),
                    b"%s\0".as_ptr() as *const libc::c_char,
                    c.as_ptr(),
                );
            }
        }
    }
}

/// Log an ERR record carrying the failing function and OS error, in the form
/// `message (func error N: description)`.
pub fn log_err(func: &str, err: &std::io::Error, msg: impl AsRef<str>) {
    log_msg(
        Severity::Err,
        format!(
            "{} ({} error {}: {})",
            msg.as_ref(),
            func,
            err.raw_os_error().unwrap_or(0),
            err
        ),
    );
}
