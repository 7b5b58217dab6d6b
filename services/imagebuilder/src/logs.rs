//! Live job logs.
//!
//! A job has one writer (its runner) and any number of readers. Lines are kept
//! in an append log for snapshot reads and fanned out over a broadcast channel
//! for followers. A subscriber only receives lines appended after it
//! subscribed; slow subscribers may miss lines.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::types_jobs::JobKind;

const FANOUT_CAPACITY: usize = 1024;

pub struct JobLog {
    lines: RwLock<Vec<String>>,
    tx: broadcast::Sender<String>,
}

impl JobLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            lines: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn append(&self, line: impl Into<String>) {
        let line = line.into();
        let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
        lines.push(line.clone());
        // No receivers is fine.
        let _ = self.tx.send(line);
    }

    pub fn snapshot(&self) -> String {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        join_lines(&lines)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Backlog plus a receiver for everything after it, with no gap or overlap.
    pub fn attach(&self) -> (String, broadcast::Receiver<String>) {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let rx = self.tx.subscribe();
        (join_lines(&lines), rx)
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for l in lines {
        out.push_str(l);
        out.push('\n');
    }
    out
}

type LogKey = (JobKind, String);

#[derive(Default)]
struct Registry {
    open: HashMap<LogKey, Arc<JobLog>>,
    /// Jobs whose log was closed on their terminal transition.
    finished: HashSet<LogKey>,
}

/// Open logs of non-terminal jobs.
#[derive(Default)]
pub struct LogHub {
    logs: RwLock<Registry>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the job's log, creating it on first use.
    pub fn open(&self, kind: JobKind, name: &str) -> Arc<JobLog> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.open
            .entry((kind, name.to_string()))
            .or_insert_with(|| Arc::new(JobLog::new()))
            .clone()
    }

    /// Like [`LogHub::open`] for readers: returns `None` once the job has
    /// finished, so a late follower never leaves a log nobody will close.
    pub fn follow(&self, kind: JobKind, name: &str) -> Option<Arc<JobLog>> {
        let key = (kind, name.to_string());
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        if logs.finished.contains(&key) {
            return None;
        }
        Some(logs.open.entry(key).or_insert_with(|| Arc::new(JobLog::new())).clone())
    }

    pub fn get(&self, kind: JobKind, name: &str) -> Option<Arc<JobLog>> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.open.get(&(kind, name.to_string())).cloned()
    }

    /// Detaches the log and marks the job finished. Followers see the stream
    /// end once the last handle drops.
    pub fn close(&self, kind: JobKind, name: &str) -> Option<Arc<JobLog>> {
        let key = (kind, name.to_string());
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let log = logs.open.remove(&key);
        logs.finished.insert(key);
        log
    }

    /// Drops everything known about a deleted job, so the name can be reused.
    pub fn forget(&self, kind: JobKind, name: &str) {
        let key = (kind, name.to_string());
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.open.remove(&key);
        logs.finished.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_only_new_lines() {
        let hub = LogHub::new();
        let log = hub.open(JobKind::Build, "b1");
        log.append("one");
        let mut rx = log.subscribe();
        log.append("two");
        log.append("three");
        assert_eq!(rx.recv().await.unwrap(), "two");
        assert_eq!(rx.recv().await.unwrap(), "three");
        assert_eq!(log.snapshot(), "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn attach_returns_backlog_then_live_lines() {
        let hub = LogHub::new();
        let log = hub.open(JobKind::Export, "e1");
        log.append("a");
        let (backlog, mut rx) = log.attach();
        log.append("b");
        assert_eq!(backlog, "a\n");
        assert_eq!(rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn closing_ends_followers() {
        let hub = LogHub::new();
        let mut rx = hub.open(JobKind::Build, "b1").subscribe();
        let closed = hub.close(JobKind::Build, "b1");
        assert!(hub.get(JobKind::Build, "b1").is_none());
        drop(closed);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn open_is_idempotent_per_job() {
        let hub = LogHub::new();
        let a = hub.open(JobKind::Build, "x");
        let b = hub.open(JobKind::Build, "x");
        let other_kind = hub.open(JobKind::Export, "x");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other_kind));
    }

    #[test]
    fn follow_opens_until_the_job_finishes() {
        let hub = LogHub::new();
        let early = hub.follow(JobKind::Build, "b1").unwrap();
        assert!(Arc::ptr_eq(&early, &hub.open(JobKind::Build, "b1")));

        hub.close(JobKind::Build, "b1");
        assert!(hub.follow(JobKind::Build, "b1").is_none());
        assert!(hub.get(JobKind::Build, "b1").is_none());

        hub.forget(JobKind::Build, "b1");
        assert!(hub.follow(JobKind::Build, "b1").is_some());
    }
}
