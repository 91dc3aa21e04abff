use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use rand::Rng;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorTable, KillState, unix_now};
use crate::config::Config;
use crate::error::AgentError;
use crate::queue::OutboundQueue;
use crate::reader;

/// Extra lifetime a periodic collector gets past its interval before
/// kill escalation starts.
const LIFETIME_GRACE_SECS: u64 = 30;

/// Gap between kill escalation steps.
const KILL_GRACE_SECS: u64 = 10;

/// Minimum pause before a long-lived collector is spawned again.
const RESPAWN_BACKOFF_SECS: u64 = 15;

/// Filename suffixes left behind by editors and package managers.
const BACKUP_SUFFIXES: &[&str] = &["~", ".bak", ".swp", ".orig"];

/// A collector executable found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub name: String,
    pub path: PathBuf,
    /// Taken from the numeric subdirectory holding the file.
    pub interval: u64,
    pub mtime: u64,
}

/// Enumerate collector executables under `root`. The layout is one
/// numeric subdirectory per interval: `<root>/60/foo` is a periodic
/// collector spawned every 60 seconds, `<root>/0/bar` is long-lived.
///
/// Eligible files are regular, executable, not dot-prefixed, and not
/// backup copies. Files that vanish mid-scan are skipped; the next scan
/// settles it.
pub fn scan_collector_dir(root: &Path) -> Vec<Discovered> {
    let mut found: Vec<Discovered> = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(root = %root.display(), %err, "cannot scan collectors root");
            return found;
        }
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let interval: u64 = match entry.file_name().to_string_lossy().parse() {
            Ok(interval) => interval,
            Err(_) => {
                tracing::debug!(dir = %dir.display(), "skipping non-numeric interval directory");
                continue;
            }
        };
        let Ok(files) = std::fs::read_dir(&dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            let name = file.file_name().to_string_lossy().to_string();
            if !eligible_name(&name) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() || !is_executable(&meta) {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if found.iter().any(|d| d.name == name) {
                tracing::warn!(collector = %name, path = %path.display(), "duplicate collector name, keeping the first");
                continue;
            }
            found.push(Discovered {
                name,
                path,
                interval,
                mtime,
            });
        }
    }
    found
}

fn eligible_name(name: &str) -> bool {
    !name.starts_with('.') && !BACKUP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

/// Keeps the collector table in sync with the directory tree, spawns
/// children on schedule, escalates kills on hung children, and reaps.
pub struct Manager {
    cfg: Arc<Config>,
    table: CollectorTable,
    queue: OutboundQueue,
    restart: Arc<Notify>,
}

impl Manager {
    pub fn new(
        cfg: Arc<Config>,
        table: CollectorTable,
        queue: OutboundQueue,
        restart: Arc<Notify>,
    ) -> Manager {
        Manager {
            cfg,
            table,
            queue,
            restart,
        }
    }

    /// Tick loop. Runs until cancelled, then shuts every child down
    /// under the escalation policy.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.manager_tick.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.restart.notified() => {
                    tracing::info!("restarting all collectors");
                    self.mark_all_for_termination();
                }
                _ = tick.tick() => {
                    self.reap();
                    self.rescan();
                    self.escalate_kills();
                    self.spawn_due();
                }
            }
        }
        self.shutdown().await;
    }

    /// Rescan the collectors root and reconcile the table: register new
    /// files, pick up upgrades, mark removed files dead.
    pub fn rescan(&self) {
        let found = scan_collector_dir(&self.cfg.collectors_root);
        let now = unix_now();
        self.table.with(|map| {
            for col in map.values_mut() {
                if !col.dead && !found.iter().any(|d| d.name == col.name) {
                    tracing::info!(collector = %col.name, "collector removed from disk");
                    col.dead = true;
                    if col.child.is_some() {
                        col.shutdown_requested = true;
                    }
                }
            }
            // Records whose file is gone are destroyed once the child
            // exits. Disabled records with a file on disk stay, so an
            // exit-13 collector is not rediscovered every tick.
            map.retain(|name, col| {
                col.child.is_some() || found.iter().any(|d| &d.name == name)
            });

            for d in found {
                match map.get_mut(&d.name) {
                    None => {
                        let mut col = Collector::new(d.name.clone(), d.interval, d.path);
                        col.mtime = d.mtime;
                        // Stagger first spawns so a restart does not
                        // fork the whole fleet in one tick.
                        let window = if d.interval > 0 {
                            d.interval
                        } else {
                            self.cfg.manager_tick
                        };
                        col.next_spawn = now + rand::rng().random_range(0..window.max(1));
                        tracing::info!(
                            collector = %col.name,
                            interval = col.interval,
                            next_spawn_in = col.next_spawn - now,
                            "registered collector"
                        );
                        map.insert(d.name, col);
                    }
                    Some(col) if col.dead => {
                        // Disabled (exit 13) or reappeared after removal.
                        // Only an upgraded file brings it back.
                        if d.mtime > col.mtime {
                            tracing::info!(collector = %col.name, "disabled collector upgraded on disk, re-enabling it");
                            col.mtime = d.mtime;
                            col.path = d.path;
                            col.interval = d.interval;
                            col.dead = false;
                            col.next_spawn = now;
                        }
                    }
                    Some(col) => {
                        if d.mtime > col.mtime {
                            tracing::info!(collector = %col.name, "collector changed on disk, restarting it");
                            col.mtime = d.mtime;
                            col.path = d.path;
                            col.interval = d.interval;
                            if col.child.is_some() {
                                col.shutdown_requested = true;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn every record whose schedule has passed. At most one spawn
    /// per record per tick.
    pub fn spawn_due(&self) {
        let now = unix_now();
        self.table.with(|map| {
            for col in map.values_mut() {
                if col.dead || col.child.is_some() || now < col.next_spawn {
                    continue;
                }
                if let Err(err) = self.spawn_collector(col, now) {
                    tracing::warn!(collector = %col.name, %err, "spawn failed");
                    col.next_spawn = now + RESPAWN_BACKOFF_SECS;
                }
            }
        });
    }

    fn spawn_collector(&self, col: &mut Collector, now: u64) -> Result<(), AgentError> {
        let mut cmd = Command::new(&col.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child leads its own process group so signals reach
            // whatever it forks.
            .process_group(0)
            .env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(&self.cfg.collector_env);

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(reader::read_stdout(
                stdout,
                col.name.clone(),
                self.table.clone(),
                self.queue.clone(),
                self.cfg.namespace_prefix.clone(),
                self.cfg.dedup_interval,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(reader::read_stderr(stderr, col.name.clone()));
        }

        col.pid = child.id();
        col.child = Some(child);
        col.last_spawn = now;
        col.kill_state = KillState::Healthy;
        col.next_kill = 0;
        col.shutdown_requested = false;
        if col.interval > 0 {
            // Schedule from spawn time; a slow run eats into its own
            // next cycle, not the one after.
            col.next_spawn = now + col.interval;
        }
        tracing::info!(collector = %col.name, pid = ?col.pid, "spawned collector");
        Ok(())
    }

    /// Collect exited children without blocking and apply the exit-code
    /// contract: 0 = normal, 13 = permanently disabled, anything else =
    /// transient failure.
    pub fn reap(&self) {
        let now = unix_now();
        self.table.with(|map| {
            for col in map.values_mut() {
                let Some(child) = col.child.as_mut() else {
                    continue;
                };
                let status = match child.try_wait() {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(collector = %col.name, %err, "wait failed");
                        continue;
                    }
                };
                col.child = None;
                col.pid = None;
                col.kill_state = KillState::Healthy;
                col.next_kill = 0;
                col.shutdown_requested = false;

                match status.code() {
                    Some(0) => {
                        tracing::debug!(collector = %col.name, "collector exited cleanly");
                    }
                    Some(13) => {
                        tracing::warn!(
                            collector = %col.name,
                            "collector reports it does not apply on this host, disabling it"
                        );
                        col.dead = true;
                    }
                    Some(code) => {
                        tracing::warn!(collector = %col.name, code, "collector exited with error");
                    }
                    None => {
                        tracing::warn!(collector = %col.name, "collector killed by signal");
                    }
                }
                if col.interval == 0 && !col.dead {
                    col.next_spawn = now + RESPAWN_BACKOFF_SECS;
                }
            }
        });
    }

    /// Walk every record with a live child through the escalation
    /// ladder: TERM, then KILL after a grace period, then abandon.
    /// Long-lived collectors escalate only when explicitly marked;
    /// periodic ones also when they outlive their interval.
    pub fn escalate_kills(&self) {
        let now = unix_now();
        self.table.with(|map| {
            for col in map.values_mut() {
                if col.child.is_none() {
                    continue;
                }
                let overdue = col.interval > 0
                    && now > col.last_spawn + col.interval + LIFETIME_GRACE_SECS;
                if !col.shutdown_requested && !overdue {
                    continue;
                }
                match col.kill_state {
                    KillState::Healthy => {
                        tracing::info!(collector = %col.name, pid = ?col.pid, "terminating collector");
                        col.signal(libc::SIGTERM);
                        col.kill_state = KillState::TermSent;
                        col.next_kill = now + KILL_GRACE_SECS;
                    }
                    KillState::TermSent if now >= col.next_kill => {
                        tracing::warn!(collector = %col.name, pid = ?col.pid, "collector ignored SIGTERM, killing it");
                        col.signal(libc::SIGKILL);
                        col.kill_state = KillState::KillSent;
                        col.next_kill = now + KILL_GRACE_SECS;
                    }
                    KillState::KillSent if now >= col.next_kill => {
                        tracing::error!(collector = %col.name, pid = ?col.pid, "collector survived SIGKILL, abandoning it");
                        col.child = None;
                        col.pid = None;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Request termination of every live child. They respawn on their
    /// normal schedule afterwards unless the agent is shutting down.
    pub fn mark_all_for_termination(&self) {
        self.table.with(|map| {
            for col in map.values_mut() {
                if col.child.is_some() {
                    col.shutdown_requested = true;
                }
            }
        });
    }

    /// Terminate every child under the escalation policy, bounded by
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down collectors");
        self.mark_all_for_termination();
        let deadline = Instant::now() + Duration::from_secs(self.cfg.shutdown_timeout.max(1));
        loop {
            self.escalate_kills();
            self.reap();
            let live = self
                .table
                .with(|map| map.values().filter(|c| c.child.is_some()).count());
            if live == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(live, "shutdown deadline reached with children still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}
