use std::collections::BTreeSet;

use nix::unistd::{getegid, geteuid};
use users::{get_group_by_name, get_user_by_name};

use crate::monitor::command::Command;
use crate::monitor::ini::IniDocument;
use crate::monitor::log::{log_msg, Severity};

/// Section holding the supervisor's own settings (`user`, `group`, and the
/// last-resort fallback for the restart-delay meta-keys).
pub const MONITOR_SECTION: &str = "fdbmonitor";

/// Keys that configure the supervisor itself and are never forwarded to the
/// child as `--key=value` options.
pub const META_KEYS: [&str; 8] = [
    "command",
    "restart_delay",
    "initial_restart_delay",
    "restart_backoff",
    "restart_delay_reset_interval",
    "disable_lifecycle_logging",
    "delete_wd40_env",
    "kill_on_configuration_change",
];

/// Environment variables removed from the child when `delete_wd40_env` is
/// set.
pub const SCRUBBED_ENV_VARS: [&str; 3] = ["WD40_BV", "WD40_IS_MY_DADDY", "CONF_BUILD_VERSION"];

/// The uid/gid children are switched to after launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorIdentity {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl MonitorIdentity {
    pub fn current() -> MonitorIdentity {
        MonitorIdentity {
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
        }
    }
}

/// Resolve the `user`/`group` names from the `[fdbmonitor]` section, falling
/// back to the supervisor's own effective ids. A name that does not resolve
/// aborts the whole reload, so the running children keep their identity.
pub fn resolve_identity(ini: &IniDocument) -> anyhow::Result<MonitorIdentity> {
    let uid = match ini.get(MONITOR_SECTION, "user") {
        Some(name) => {
            get_user_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("unable to lookup user {name}"))?
                .uid()
        }
        None => geteuid().as_raw(),
    };
    let gid = match ini.get(MONITOR_SECTION, "group") {
        Some(name) => {
            get_group_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("unable to lookup group {name}"))?
                .gid()
        }
        None => getegid().as_raw(),
    };
    Ok(MonitorIdentity { uid, gid })
}

/// Split an instance section name into its class and numeric id.
///
/// The suffix after the last `.` must parse fully as a non-zero decimal
/// `u64`; anything else is not an instance section.
pub fn parse_section_name(name: &str) -> Option<(&str, u64)> {
    let (class, id_str) = name.rsplit_once('.')?;
    let id: u64 = id_str.parse().ok()?;
    if id == 0 {
        return None;
    }
    Some((class, id))
}

/// Materialize the Command for one `class.id` section.
///
/// Any parse or resolution failure is logged at ERR and leaves the returned
/// Command un-launchable (empty argv); the supervisor keeps running.
pub fn build_command(ini: &IniDocument, class: &str, id: u64) -> Command {
    let mut cmd = Command::new(class, id);
    let ssection = cmd.ssection.clone();

    // The restart-delay meta-keys fall back one level further than the rest,
    // into the supervisor's own section.
    let delay_chain: [&str; 4] = [ssection.as_str(), class, "general", MONITOR_SECTION];
    let chain: [&str; 3] = [ssection.as_str(), class, "general"];

    let Some(rd) = ini.value_multi("restart_delay", &delay_chain) else {
        log_msg(Severity::Err, format!("Unable to resolve restart delay for {ssection}"));
        return cmd;
    };
    let Ok(max_restart_delay) = rd.parse::<u32>() else {
        log_msg(Severity::Err, format!("Unable to parse restart delay for {ssection}"));
        return cmd;
    };
    cmd.max_restart_delay = max_restart_delay;

    cmd.initial_restart_delay = match ini.value_multi("initial_restart_delay", &delay_chain) {
        None => 0,
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) => v.min(max_restart_delay),
            Err(_) => {
                log_msg(
                    Severity::Err,
                    format!("Unable to parse initial restart delay for {ssection}"),
                );
                return cmd;
            }
        },
    };
    cmd.current_restart_delay = cmd.initial_restart_delay as f64;

    cmd.restart_backoff = match ini.value_multi("restart_backoff", &delay_chain) {
        None => max_restart_delay as f64,
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v >= 1.0 => v,
            Ok(v) => {
                log_msg(
                    Severity::Err,
                    format!("Invalid restart backoff value {v} for {ssection}"),
                );
                return cmd;
            }
            Err(_) => {
                log_msg(Severity::Err, format!("Unable to parse restart backoff for {ssection}"));
                return cmd;
            }
        },
    };

    cmd.restart_delay_reset_interval =
        match ini.value_multi("restart_delay_reset_interval", &delay_chain) {
            None => max_restart_delay,
            Some(raw) => match raw.parse::<u32>() {
                Ok(v) => v,
                Err(_) => {
                    log_msg(
                        Severity::Err,
                        format!("Unable to parse restart delay reset interval for {ssection}"),
                    );
                    return cmd;
                }
            },
        };

    cmd.quiet = ini.value_multi("disable_lifecycle_logging", &chain) == Some("true");
    cmd.delete_wd40_env = ini.value_multi("delete_wd40_env", &chain) == Some("true");
    // Default true; any configured value other than the literal "true" turns
    // it off.
    cmd.kill_on_configuration_change = match ini.value_multi("kill_on_configuration_change", &chain)
    {
        Some(v) => v == "true",
        None => true,
    };

    let Some(binary) = ini.value_multi("command", &chain) else {
        log_msg(Severity::Err, format!("Unable to resolve command for {ssection}"));
        return cmd;
    };
    let mut argv: Vec<String> = binary.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        log_msg(Severity::Err, format!("Unable to resolve command for {ssection}"));
        return cmd;
    }

    // All non-meta keys from the instance, class and general sections are
    // forwarded as --key=value, deduplicated with instance > class > general
    // precedence and appended in key order.
    let id_str = id.to_string();
    let mut option_keys: BTreeSet<&str> = BTreeSet::new();
    for section in chain {
        if let Some(sec) = ini.section(section) {
            option_keys.extend(sec.keys());
        }
    }
    for key in option_keys {
        if META_KEYS.contains(&key) {
            continue;
        }
        let Some(value) = ini.value_multi(key, &chain) else {
            continue;
        };
        argv.push(format!("--{key}={}", value.replace("$ID", &id_str)));
    }

    cmd.argv = argv;
    cmd
}
