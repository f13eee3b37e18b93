use std::collections::HashMap;

use crate::monitor::command::Command;

/// The supervisor's inventory: every configured Command keyed by id, plus
/// the pid bookkeeping for the subset that is currently running.
///
/// `id_pid` and `pid_id` are maintained in lockstep; every pid they mention
/// belongs to an id present in `commands`.
#[derive(Debug, Default)]
pub struct ProcessTable {
    commands: HashMap<u64, Command>,
    id_pid: HashMap<u64, libc::pid_t>,
    pid_id: HashMap<libc::pid_t, u64>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable::default()
    }

    pub fn insert_command(&mut self, cmd: Command) {
        self.commands.insert(cmd.id, cmd);
    }

    /// Swap in a new Command under its id, returning the superseded one.
    /// Any pid entry keeps pointing at the id, so a still-running child is
    /// adopted by the replacement.
    pub fn replace_command(&mut self, cmd: Command) -> Option<Command> {
        self.commands.insert(cmd.id, cmd)
    }

    /// Drop a Command from the table. Callers must have removed any pid
    /// entry first (kill + reap, or plain reap).
    pub fn remove_command(&mut self, id: u64) -> Option<Command> {
        debug_assert!(!self.id_pid.contains_key(&id));
        self.commands.remove(&id)
    }

    pub fn command(&self, id: u64) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn command_mut(&mut self, id: u64) -> Option<&mut Command> {
        self.commands.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.commands.contains_key(&id)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.commands.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record a successful launch. The id must name a known Command.
    pub fn record_start(&mut self, id: u64, pid: libc::pid_t) {
        debug_assert!(self.commands.contains_key(&id));
        self.id_pid.insert(id, pid);
        self.pid_id.insert(pid, id);
    }

    /// Remove the pid bookkeeping for a reaped or killed child, returning
    /// the id it belonged to.
    pub fn remove_pid(&mut self, pid: libc::pid_t) -> Option<u64> {
        let id = self.pid_id.remove(&pid)?;
        self.id_pid.remove(&id);
        Some(id)
    }

    pub fn pid_of(&self, id: u64) -> Option<libc::pid_t> {
        self.id_pid.get(&id).copied()
    }

    pub fn id_of(&self, pid: libc::pid_t) -> Option<u64> {
        self.pid_id.get(&pid).copied()
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.id_pid.contains_key(&id)
    }

    pub fn running_ids(&self) -> Vec<u64> {
        self.id_pid.keys().copied().collect()
    }

    pub fn running_len(&self) -> usize {
        self.id_pid.len()
    }

    #[cfg(test)]
    pub fn invariants_hold(&self) -> bool {
        self.id_pid.len() == self.pid_id.len()
            && self.id_pid.iter().all(|(id, pid)| {
                self.pid_id.get(pid) == Some(id) && self.commands.contains_key(id)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn cmd(id: u64) -> Command {
        let mut c = Command::new("worker", id);
        c.argv = vec!["/bin/child".to_string()];
        c
    }

    #[test]
    fn start_and_reap_round_trip() {
        let mut table = ProcessTable::new();
        table.insert_command(cmd(1));
        table.record_start(1, 4242);

        assert!(table.is_running(1));
        assert_eq!(table.pid_of(1), Some(4242));
        assert_eq!(table.id_of(4242), Some(1));
        assert!(table.invariants_hold());

        assert_eq!(table.remove_pid(4242), Some(1));
        assert!(!table.is_running(1));
        assert!(table.contains(1));
        assert!(table.invariants_hold());
    }

    #[test]
    fn unknown_pid_is_ignored() {
        let mut table = ProcessTable::new();
        table.insert_command(cmd(1));
        assert_eq!(table.remove_pid(999), None);
        assert!(table.invariants_hold());
    }

    proptest! {
        // Bijection invariant: after any interleaving of inserts, starts,
        // reaps and removals, id_pid and pid_id stay mutual inverses and
        // only mention ids that have a Command.
        #[test]
        fn mappings_stay_in_lockstep(ops in proptest::collection::vec((0u8..4, 1u64..6), 1..60)) {
            let mut table = ProcessTable::new();
            let mut next_pid: libc::pid_t = 100;
            for (op, id) in ops {
                match op {
                    0 => table.insert_command(cmd(id)),
                    1 => {
                        if table.contains(id) && !table.is_running(id) {
                            next_pid += 1;
                            table.record_start(id, next_pid);
                        }
                    }
                    2 => {
                        if let Some(pid) = table.pid_of(id) {
                            table.remove_pid(pid);
                        }
                    }
                    _ => {
                        if table.contains(id) && !table.is_running(id) {
                            table.remove_command(id);
                        }
                    }
                }
                prop_assert!(table.invariants_hold());
            }
        }
    }
}
