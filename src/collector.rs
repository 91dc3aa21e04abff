use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::process::Child;

use crate::sample::MetricValue;

/// Seconds since the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Kill escalation state for a running child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillState {
    /// No termination signal sent.
    Healthy,
    /// SIGTERM delivered; waiting for the child to exit.
    TermSent,
    /// SIGKILL delivered; the child is expected to be gone.
    KillSent,
}

impl KillState {
    pub fn as_u8(self) -> u8 {
        match self {
            KillState::Healthy => 0,
            KillState::TermSent => 1,
            KillState::KillSent => 2,
        }
    }
}

/// Per-series deduplication state.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    /// Value of the last emitted sample.
    pub value: MetricValue,
    /// Timestamp of the last emitted sample.
    pub emitted_ts: u64,
    /// Timestamp of the most recent observation, emitted or not.
    pub seen_ts: u64,
    /// Consecutive observations suppressed since the last emission.
    pub suppressed: u64,
}

/// Bookkeeping for one collector executable.
pub struct Collector {
    pub name: String,
    /// Seconds between spawns. Zero means long-lived: spawn once and
    /// keep it running.
    pub interval: u64,
    pub path: PathBuf,
    /// mtime of the executable, seconds since the epoch. An increase on
    /// disk means the collector was upgraded and the child must restart.
    pub mtime: u64,
    pub child: Option<Child>,
    /// Pid recorded at spawn; `Child::id` goes away once the process is
    /// reaped but signals may still be needed before that.
    pub pid: Option<u32>,
    pub last_spawn: u64,
    pub next_spawn: u64,
    pub kill_state: KillState,
    /// When the next escalation step fires, seconds since the epoch.
    pub next_kill: u64,
    /// Set when the running child must go away (upgrade, removal,
    /// reload, shutdown). Only meaningful while a child exists.
    pub shutdown_requested: bool,
    pub lines_received: u64,
    pub lines_sent: u64,
    pub lines_invalid: u64,
    /// Wall-clock time of the last valid line.
    pub last_datapoint: u64,
    /// Removed from disk or permanently disabled (exit code 13).
    pub dead: bool,
    pub(crate) dedup: HashMap<String, DedupEntry>,
}

impl Collector {
    pub fn new(name: impl Into<String>, interval: u64, path: impl Into<PathBuf>) -> Self {
        Collector {
            name: name.into(),
            interval,
            path: path.into(),
            mtime: 0,
            child: None,
            pid: None,
            last_spawn: 0,
            next_spawn: 0,
            kill_state: KillState::Healthy,
            next_kill: 0,
            shutdown_requested: false,
            lines_received: 0,
            lines_sent: 0,
            lines_invalid: 0,
            last_datapoint: unix_now(),
            dead: false,
            dedup: HashMap::new(),
        }
    }

    /// Deliver a signal to the child's process group. The child is its
    /// own group leader, so the negative pid reaches grandchildren too.
    pub fn signal(&self, sig: i32) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    pub fn status(&self) -> CollectorStatus {
        CollectorStatus {
            name: self.name.clone(),
            mtime: self.mtime,
            lastspawn: self.last_spawn,
            killstate: self.kill_state.as_u8(),
            nextkill: self.next_kill,
            lines_sent: self.lines_sent,
            lines_received: self.lines_received,
            lines_invalid: self.lines_invalid,
            last_datapoint: self.last_datapoint,
            dead: self.dead,
        }
    }
}

/// Read-only view of one collector record, served by the status
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorStatus {
    pub name: String,
    pub mtime: u64,
    pub lastspawn: u64,
    pub killstate: u8,
    pub nextkill: u64,
    pub lines_sent: u64,
    pub lines_received: u64,
    pub lines_invalid: u64,
    pub last_datapoint: u64,
    pub dead: bool,
}

/// Shared registry of collector records. Mutated by the manager (record
/// lifecycle) and the readers (counters, dedup state); read by the
/// status server. The lock is never held across an await point.
#[derive(Clone, Default)]
pub struct CollectorTable {
    inner: Arc<Mutex<HashMap<String, Collector>>>,
}

impl CollectorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the whole table.
    pub fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Collector>) -> R) -> R {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut map)
    }

    /// Run `f` against one record. Returns None when the record is gone,
    /// which readers treat as "collector was removed, stop counting".
    pub fn with_collector<R>(&self, name: &str, f: impl FnOnce(&mut Collector) -> R) -> Option<R> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get_mut(name).map(f)
    }

    pub fn insert(&self, collector: Collector) {
        self.with(|map| {
            map.insert(collector.name.clone(), collector);
        });
    }

    pub fn len(&self) -> usize {
        self.with(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent snapshot for the status surface, sorted by name.
    pub fn snapshot(&self) -> Vec<CollectorStatus> {
        let mut statuses = self.with(|map| map.values().map(Collector::status).collect::<Vec<_>>());
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_json_field_set() {
        let mut col = Collector::new("myname", 17, "myname");
        col.mtime = 23;
        col.last_spawn = 15;
        col.next_kill = 8;
        col.kill_state = KillState::KillSent;
        col.lines_sent = 10;
        col.lines_received = 65;
        col.lines_invalid = 7;

        let json = serde_json::to_value(col.status()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "myname",
                "mtime": 23,
                "lastspawn": 15,
                "killstate": 2,
                "nextkill": 8,
                "lines_sent": 10,
                "lines_received": 65,
                "lines_invalid": 7,
                "last_datapoint": col.last_datapoint,
                "dead": false,
            })
        );
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let table = CollectorTable::new();
        table.insert(Collector::new("b", 0, "b"));
        table.insert(Collector::new("a", 0, "a"));
        let names: Vec<String> = table.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
