//! The authoritative registry of supervised children.

use schema::SpawnOptions;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::warn;

/// Run-time record of one supervised OS process.
#[derive(Debug)]
pub struct ChildRecord {
    /// Descriptive command text.
    pub cmd: String,
    /// OS pid; the key in the table.
    pub pid: i32,
    /// Optional polite-shutdown command.
    pub kill_cmd: Option<String>,
    /// Pid of an in-flight kill-command helper.
    pub kill_cmd_pid: Option<i32>,
    /// Instant by which the shutdown machine escalates to SIGKILL.
    /// Set iff a first termination action (kill command or SIGTERM)
    /// has fired; it outlives the kill-command helper.
    pub deadline: Option<Instant>,
    /// The peer asked for termination and SIGTERM (or the first
    /// termination action) has happened.
    pub sigterm: bool,
    /// SIGKILL has been sent; terminal for the shutdown machine.
    pub sigkill: bool,
    /// Grace between the first termination action and SIGKILL.
    pub kill_timeout: Duration,
    /// Attached via `manage` rather than spawned here.
    pub managed: bool,
    /// Queue feeding the child's stdin, when piped.
    pub stdin: Option<UnboundedSender<Vec<u8>>>,
    /// Captured output pumps still running for this child.
    pub open_streams: u8,
    /// Raw wait status held back until the output pumps finish.
    pub pending_status: Option<i32>,
}

impl ChildRecord {
    /// Record for an externally started pid. No pipes are owned; only
    /// the kill options from the request apply.
    pub fn managed(pid: i32, options: &SpawnOptions) -> Self {
        Self {
            cmd: "managed pid".to_string(),
            pid,
            kill_cmd: options.kill_cmd.clone(),
            kill_cmd_pid: None,
            deadline: None,
            sigterm: false,
            sigkill: false,
            kill_timeout: options.kill_timeout,
            managed: true,
            stdin: None,
            open_streams: 0,
            pending_status: None,
        }
    }
}

/// Children keyed by pid. Mutated only by the supervisor task.
#[derive(Debug, Default)]
pub struct ChildTable {
    children: HashMap<i32, ChildRecord>,
}

impl ChildTable {
    pub fn insert(&mut self, record: ChildRecord) {
        let pid = record.pid;
        if self.children.insert(pid, record).is_some() {
            warn!(pid, "replaced an existing child record");
        }
    }

    pub fn get(&self, pid: i32) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut ChildRecord> {
        self.children.get_mut(&pid)
    }

    /// Remove a record. Dropping it drops the stdin sender, which lets
    /// the stdin writer task close the pipe.
    pub fn remove(&mut self, pid: i32) -> Option<ChildRecord> {
        self.children.remove(&pid)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.children.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.children.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i32) -> ChildRecord {
        ChildRecord::managed(pid, &SpawnOptions::default())
    }

    #[test]
    fn test_insert_find_erase() {
        let mut table = ChildTable::default();
        assert!(table.is_empty());

        table.insert(record(10));
        table.insert(record(20));
        assert_eq!(table.len(), 2);
        assert!(table.contains(10));
        assert_eq!(table.get(20).map(|r| r.pid), Some(20));

        let removed = table.remove(10).expect("present");
        assert_eq!(removed.pid, 10);
        assert!(!table.contains(10));
        assert!(table.remove(10).is_none());
    }

    #[test]
    fn test_pid_appears_at_most_once() {
        let mut table = ChildTable::default();
        table.insert(record(7));
        table.insert(record(7));
        assert_eq!(table.len(), 1);
        assert_eq!(table.pids(), vec![7]);
    }

    #[test]
    fn test_managed_record_defaults() {
        let rec = record(5);
        assert!(rec.managed);
        assert!(rec.stdin.is_none());
        assert_eq!(rec.open_streams, 0);
        assert!(!rec.sigterm && !rec.sigkill);
        assert_eq!(rec.kill_timeout, schema::DEFAULT_KILL_TIMEOUT);
    }
}
