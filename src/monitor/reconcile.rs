use std::collections::HashSet;

use crate::monitor::command::Command;
use crate::monitor::config::{self, MonitorIdentity};
use crate::monitor::ini::IniDocument;
use crate::monitor::log::{log_msg, Severity};
use crate::monitor::table::ProcessTable;

/// One step of a reconcile pass, in application order.
#[derive(Debug)]
pub enum PlannedAction {
    /// Section vanished; the instance keeps running until it exits on its
    /// own, then its Command is destroyed.
    MarkDeconfigured { id: u64 },
    /// Section vanished and the instance is killed now.
    KillDeconfigured { id: u64 },
    /// Section content changed in a way that needs a new Command object.
    /// With `restart`, the running child is killed and the new Command is
    /// started immediately; without it, the child keeps running and the new
    /// Command takes effect on its next natural restart.
    Replace { id: u64, cmd: Command, restart: bool },
    /// argv is unchanged; only the mutable options are copied over.
    UpdateOptions { id: u64, cmd: Command },
    /// A section with no running child: newly configured, or one whose
    /// child is gone (including instances scheduled for an identity kill).
    Start { id: u64, cmd: Command },
}

/// The full outcome of diffing a parsed configuration against the process
/// table. Computed without side effects so it can be inspected and tested;
/// the event loop applies it.
#[derive(Debug)]
pub struct ReconcilePlan {
    pub identity: MonitorIdentity,
    /// Running instances killed up front because the effective user or
    /// group changed. Those still configured reappear as `Start` actions.
    pub identity_kills: Vec<u64>,
    pub actions: Vec<PlannedAction>,
}

impl ReconcilePlan {
    /// Ids whose running child this plan terminates.
    pub fn kills(&self) -> Vec<u64> {
        let mut out = self.identity_kills.clone();
        for action in &self.actions {
            match action {
                PlannedAction::KillDeconfigured { id } => out.push(*id),
                PlannedAction::Replace { id, restart: true, .. } => out.push(*id),
                _ => {}
            }
        }
        out
    }

    pub fn starts(&self) -> Vec<u64> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                PlannedAction::Start { id, .. } => Some(*id),
                PlannedAction::Replace { id, restart: true, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// Diff the freshly parsed configuration against the current process table.
///
/// Errors only when the configured user or group cannot be resolved, in
/// which case the whole reload is abandoned and the running set is left
/// untouched.
pub fn plan(
    ini: &IniDocument,
    table: &ProcessTable,
    current_identity: MonitorIdentity,
) -> anyhow::Result<ReconcilePlan> {
    let identity = config::resolve_identity(ini)?;

    // Any identity change restarts every kill-on-change instance so the new
    // uid/gid takes effect.
    let mut identity_kills: Vec<u64> = Vec::new();
    if identity != current_identity {
        identity_kills = table
            .running_ids()
            .into_iter()
            .filter(|id| {
                table
                    .command(*id)
                    .is_some_and(|c| c.kill_on_configuration_change)
            })
            .collect();
        identity_kills.sort_unstable();
    }

    let mut actions: Vec<PlannedAction> = Vec::new();

    let mut survivors: Vec<u64> = table
        .running_ids()
        .into_iter()
        .filter(|id| !identity_kills.contains(id))
        .collect();
    survivors.sort_unstable();

    for id in survivors {
        let Some(existing) = table.command(id) else {
            continue;
        };

        if !ini.has_section(&existing.ssection) {
            if existing.kill_on_configuration_change {
                actions.push(PlannedAction::KillDeconfigured { id });
            } else {
                actions.push(PlannedAction::MarkDeconfigured { id });
            }
            continue;
        }

        let candidate = config::build_command(ini, &existing.class, id);
        // Turning kill_on_configuration_change on also forces a restart so
        // any config changes that accumulated while it was off are applied.
        if existing.argv_differs(&candidate)
            || (candidate.kill_on_configuration_change && !existing.kill_on_configuration_change)
        {
            let restart = candidate.kill_on_configuration_change;
            actions.push(PlannedAction::Replace { id, cmd: candidate, restart });
        } else {
            actions.push(PlannedAction::UpdateOptions { id, cmd: candidate });
        }
    }

    let mut planned_starts: HashSet<u64> = HashSet::new();
    for section in ini.sections() {
        let Some((class, id)) = config::parse_section_name(section.name()) else {
            if section.name().contains('.') {
                log_msg(Severity::Err, format!("Found bogus id in {}", section.name()));
            }
            continue;
        };
        if table.is_running(id) && !identity_kills.contains(&id) {
            continue;
        }
        // Two instance sections can carry the same numeric id; the first
        // one seen wins, like the table they feed.
        if !planned_starts.insert(id) {
            continue;
        }
        let cmd = config::build_command(ini, class, id);
        actions.push(PlannedAction::Start { id, cmd });
    }

    Ok(ReconcilePlan {
        identity,
        identity_kills,
        actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ini(raw: &str) -> IniDocument {
        IniDocument::parse(raw)
    }

    fn identity() -> MonitorIdentity {
        MonitorIdentity::current()
    }

    fn running_table(ini_doc: &IniDocument, entries: &[(u64, libc::pid_t)]) -> ProcessTable {
        let mut table = ProcessTable::new();
        for (id, pid) in entries {
            let cmd = config::build_command(ini_doc, "worker", *id);
            assert!(cmd.launchable());
            table.insert_command(cmd);
            table.record_start(*id, *pid);
        }
        table
    }

    const TWO_WORKERS: &str = r#"
[general]
restart_delay = 60

[worker.1]
command = /bin/child

[worker.2]
command = /bin/child
"#;

    #[test]
    fn cold_start_plans_one_start_per_instance() {
        let doc = ini(TWO_WORKERS);
        let table = ProcessTable::new();
        let plan = plan(&doc, &table, identity()).unwrap();

        assert!(plan.identity_kills.is_empty());
        assert_eq!(plan.starts(), vec![1, 2]);
        for action in &plan.actions {
            match action {
                PlannedAction::Start { cmd, .. } => {
                    assert_eq!(cmd.argv, vec!["/bin/child"]);
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    #[test]
    fn identical_reload_is_a_noop() {
        let doc = ini(TWO_WORKERS);
        let table = running_table(&doc, &[(1, 101), (2, 102)]);
        let plan = plan(&doc, &table, identity()).unwrap();

        assert!(plan.kills().is_empty());
        assert!(plan.starts().is_empty());
        for action in &plan.actions {
            match action {
                PlannedAction::UpdateOptions { cmd, .. } => {
                    assert!(!cmd.argv.is_empty());
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    #[test]
    fn added_instance_starts_without_touching_the_rest() {
        let one = ini("[general]\nrestart_delay = 60\n\n[worker.1]\ncommand = /bin/child\n");
        let table = running_table(&one, &[(1, 101)]);
        let plan = plan(&ini(TWO_WORKERS), &table, identity()).unwrap();

        assert!(plan.kills().is_empty());
        assert_eq!(plan.starts(), vec![2]);
    }

    #[test]
    fn changed_argv_kills_and_restarts() {
        let doc = ini(TWO_WORKERS);
        let table = running_table(&doc, &[(1, 101), (2, 102)]);

        let changed = ini(r#"
[general]
restart_delay = 60

[worker.1]
command = /bin/child2

[worker.2]
command = /bin/child
"#);
        let plan = plan(&changed, &table, identity()).unwrap();
        assert_eq!(plan.kills(), vec![1]);
        assert_eq!(plan.starts(), vec![1]);
        let replaced = plan
            .actions
            .iter()
            .find_map(|a| match a {
                PlannedAction::Replace { id: 1, cmd, restart } => Some((cmd, *restart)),
                _ => None,
            })
            .expect("worker.1 replaced");
        assert!(replaced.1);
        assert_eq!(replaced.0.argv, vec!["/bin/child2"]);
    }

    #[test]
    fn forwarded_option_change_is_an_argv_change() {
        let doc = ini(TWO_WORKERS);
        let table = running_table(&doc, &[(1, 101)]);

        let changed = ini(r#"
[general]
restart_delay = 60

[worker.1]
command = /bin/child
datadir = /var/lib/1

[worker.2]
command = /bin/child
"#);
        let plan = plan(&changed, &table, identity()).unwrap();
        assert_eq!(plan.kills(), vec![1]);
    }

    #[test]
    fn vanished_section_is_killed_or_left_running() {
        let doc = ini(TWO_WORKERS);
        let table = running_table(&doc, &[(1, 101), (2, 102)]);

        let only_two = ini("[general]\nrestart_delay = 60\n\n[worker.2]\ncommand = /bin/child\n");
        let killing = plan(&only_two, &table, identity()).unwrap();
        assert!(matches!(
            killing.actions.first(),
            Some(PlannedAction::KillDeconfigured { id: 1 })
        ));

        // With kill_on_configuration_change off the instance just keeps
        // running as deconfigured.
        let no_kill = ini(r#"
[general]
restart_delay = 60
kill_on_configuration_change = no

[worker.1]
command = /bin/child

[worker.2]
command = /bin/child
"#);
        let table = running_table(&no_kill, &[(1, 101), (2, 102)]);
        let keeping = plan(&only_two, &table, identity()).unwrap();
        assert!(matches!(
            keeping.actions.first(),
            Some(PlannedAction::MarkDeconfigured { id: 1 })
        ));
    }

    #[test]
    fn enabling_kill_on_change_forces_a_restart() {
        let off = ini(r#"
[general]
restart_delay = 60
kill_on_configuration_change = no

[worker.1]
command = /bin/child
"#);
        let table = running_table(&off, &[(1, 101)]);

        let on = ini("[general]\nrestart_delay = 60\n\n[worker.1]\ncommand = /bin/child\n");
        let plan = plan(&on, &table, identity()).unwrap();
        assert_eq!(plan.kills(), vec![1]);
        assert_eq!(plan.starts(), vec![1]);
    }

    #[test]
    fn bogus_id_sections_are_skipped() {
        let doc = ini(r#"
[general]
restart_delay = 60

[worker.0]
command = /bin/child

[worker.2x]
command = /bin/child
"#);
        let plan = plan(&doc, &ProcessTable::new(), identity()).unwrap();
        assert!(plan.starts().is_empty());
    }

    #[test]
    fn not_running_instance_is_started_fresh_on_reload() {
        let doc = ini(TWO_WORKERS);
        let mut table = running_table(&doc, &[(1, 101), (2, 102)]);
        // worker.2 exited and is awaiting its backoff restart.
        table.remove_pid(102);

        let plan = plan(&doc, &table, identity()).unwrap();
        assert_eq!(plan.starts(), vec![2]);
    }
}
