//! Long-running operations (build, deploy) as observable records.
//!
//! A record holds an append-only log and a terminal verdict. Consumers attach
//! at any time and replay the log from the start, then follow it live until
//! exactly one `done` event. Cancelling a record freezes its log.

use crate::error::OperationError;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Build,
    Deploy,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Build => f.write_str("build"),
            OperationKind::Deploy => f.write_str("deploy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationEvent {
    Log { line: String },
    Done { success: bool, cancelled: bool },
}

struct RecordState {
    lines: Vec<String>,
    status: OperationStatus,
}

struct OperationRecord {
    id: Uuid,
    kind: OperationKind,
    started_at: DateTime<Utc>,
    state: Mutex<RecordState>,
    /// Bumped after every state change.
    changed: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl OperationRecord {
    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

/// Producer side of an operation. Cheap to clone.
#[derive(Clone)]
pub struct OperationHandle {
    record: Arc<OperationRecord>,
}

impl OperationHandle {
    fn new(kind: OperationKind) -> Self {
        let (changed, _rx) = watch::channel(0);
        Self {
            record: Arc::new(OperationRecord {
                id: Uuid::new_v4(),
                kind,
                started_at: Utc::now(),
                state: Mutex::new(RecordState {
                    lines: Vec::new(),
                    status: OperationStatus::Running,
                }),
                changed,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn kind(&self) -> OperationKind {
        self.record.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.record.started_at
    }

    /// Append a line. Ignored (returns false) once the operation has ended.
    pub fn log(&self, line: impl Into<String>) -> bool {
        {
            let mut state = self.record.state();
            if state.status.is_terminal() {
                return false;
            }
            state.lines.push(line.into());
        }
        self.record.notify();
        true
    }

    /// Record the verdict. A cancelled operation stays cancelled.
    pub fn finish(&self, success: bool) -> OperationStatus {
        let status = {
            let mut state = self.record.state();
            if !state.status.is_terminal() {
                state.status = if success {
                    OperationStatus::Success
                } else {
                    OperationStatus::Failure
                };
            }
            state.status
        };
        self.record.notify();
        status
    }

    /// Mark the operation cancelled and signal its token.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.record.state();
            if state.status.is_terminal() {
                false
            } else {
                state.status = OperationStatus::Cancelled;
                true
            }
        };
        if cancelled {
            tracing::info!(operation = %self.record.kind, id = %self.record.id, "Operation cancelled");
            self.record.notify();
            self.record.cancel.cancel();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.record.cancel.is_cancelled()
    }

    /// Token to pass into every blocking call made on behalf of this operation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.record.cancel.clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.record.state().status
    }

    pub fn lines(&self) -> Vec<String> {
        self.record.state().lines.clone()
    }

    pub fn subscribe(&self) -> OperationSubscription {
        OperationSubscription {
            record: Arc::clone(&self.record),
            rx: self.record.changed.subscribe(),
            cursor: 0,
            done: false,
        }
    }
}

/// Consumer side: the full log in order, then one `done`.
pub struct OperationSubscription {
    record: Arc<OperationRecord>,
    rx: watch::Receiver<u64>,
    cursor: usize,
    done: bool,
}

impl OperationSubscription {
    pub async fn next(&mut self) -> Option<OperationEvent> {
        if self.done {
            return None;
        }
        loop {
            // Mark seen before reading state so no change slips between the two.
            let _ = self.rx.borrow_and_update();
            {
                let state = self.record.state();
                if let Some(line) = state.lines.get(self.cursor) {
                    self.cursor += 1;
                    return Some(OperationEvent::Log { line: line.clone() });
                }
                if state.status.is_terminal() {
                    self.done = true;
                    return Some(OperationEvent::Done {
                        success: state.status == OperationStatus::Success,
                        cancelled: state.status == OperationStatus::Cancelled,
                    });
                }
            }
            if self.rx.changed().await.is_err() {
                // The record owns the sender, so this cannot happen while we hold it.
                self.done = true;
                return None;
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = OperationEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}

/// At most one record per kind, with a create/attach/complete/evict lifecycle.
#[derive(Default)]
pub struct OperationRegistry {
    active: Mutex<HashMap<OperationKind, OperationHandle>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<OperationKind, OperationHandle>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a record. Rejected while another of the same kind is running;
    /// a finished one is replaced.
    pub fn start(&self, kind: OperationKind) -> Result<OperationHandle, OperationError> {
        let mut active = self.active();
        if let Some(existing) = active.get(&kind) {
            if !existing.status().is_terminal() {
                return Err(OperationError::AlreadyRunning(kind.to_string()));
            }
        }
        let handle = OperationHandle::new(kind);
        tracing::debug!(operation = %kind, id = %handle.id(), "Operation started");
        active.insert(kind, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, kind: OperationKind) -> Option<OperationHandle> {
        self.active().get(&kind).cloned()
    }

    pub fn attach(&self, kind: OperationKind) -> Option<OperationSubscription> {
        self.get(kind).map(|handle| handle.subscribe())
    }

    pub fn status(&self, kind: OperationKind) -> Option<OperationStatus> {
        self.get(kind).map(|handle| handle.status())
    }

    pub fn cancel(&self, kind: OperationKind) -> bool {
        self.get(kind).map(|handle| handle.cancel()).unwrap_or(false)
    }

    /// Drop a finished record. Running records stay.
    pub fn evict(&self, kind: OperationKind) -> Option<OperationHandle> {
        let mut active = self.active();
        match active.get(&kind) {
            Some(handle) if handle.status().is_terminal() => active.remove(&kind),
            _ => None,
        }
    }
}

/// Start a record and drive `work` on the runtime; its result is the verdict.
///
/// A panicking `work` counts as a failure, so the record always ends.
pub fn run_operation<F, Fut>(
    registry: &OperationRegistry,
    kind: OperationKind,
    work: F,
) -> Result<(OperationHandle, JoinHandle<OperationStatus>), OperationError>
where
    F: FnOnce(OperationHandle) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let handle = registry.start(kind)?;
    let future = work(handle.clone());
    let finisher = handle.clone();
    let task = tokio::spawn(async move {
        let success = match tokio::spawn(future).await {
            Ok(success) => success,
            Err(e) => {
                tracing::error!(operation = %kind, id = %finisher.id(), "Operation aborted: {}", e);
                finisher.log(format!("❌ {} aborted: {}", kind, e));
                false
            }
        };
        finisher.finish(success)
    });
    Ok((handle, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_late_subscriber_replays_log_then_done() {
        let registry = OperationRegistry::new();
        let handle = registry.start(OperationKind::Build).unwrap();
        handle.log("step 1");
        handle.log("step 2");
        handle.finish(true);

        let events: Vec<_> = registry
            .attach(OperationKind::Build)
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                OperationEvent::Log {
                    line: "step 1".into()
                },
                OperationEvent::Log {
                    line: "step 2".into()
                },
                OperationEvent::Done {
                    success: true,
                    cancelled: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_live_subscriber_follows_log() {
        let registry = OperationRegistry::new();
        let handle = registry.start(OperationKind::Deploy).unwrap();
        let mut subscription = handle.subscribe();

        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    handle.log(format!("line {}", i));
                    tokio::task::yield_now().await;
                }
                handle.finish(false);
            })
        };

        let mut lines = Vec::new();
        let done = loop {
            match subscription.next().await.unwrap() {
                OperationEvent::Log { line } => lines.push(line),
                done @ OperationEvent::Done { .. } => break done,
            }
        };
        producer.await.unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], "line 4");
        assert_eq!(
            done,
            OperationEvent::Done {
                success: false,
                cancelled: false
            }
        );
        assert!(subscription.next().await.is_none());
    }

    #[test]
    fn test_one_running_record_per_kind() {
        let registry = OperationRegistry::new();
        let build = registry.start(OperationKind::Build).unwrap();
        assert_eq!(
            registry.start(OperationKind::Build).err(),
            Some(OperationError::AlreadyRunning("build".into()))
        );
        assert!(registry.start(OperationKind::Deploy).is_ok());

        assert!(registry.evict(OperationKind::Build).is_none());
        build.finish(true);
        assert!(registry.start(OperationKind::Build).is_ok());
        registry.get(OperationKind::Build).unwrap().finish(true);
        assert!(registry.evict(OperationKind::Build).is_some());
        assert!(registry.attach(OperationKind::Build).is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let log = serde_json::to_value(OperationEvent::Log { line: "x".into() }).unwrap();
        assert_eq!(log, serde_json::json!({"type": "log", "line": "x"}));
        let done = serde_json::to_value(OperationEvent::Done {
            success: true,
            cancelled: false,
        })
        .unwrap();
        assert_eq!(
            done,
            serde_json::json!({"type": "done", "success": true, "cancelled": false})
        );
    }

    #[tokio::test]
    async fn test_run_operation_records_verdict() {
        let registry = OperationRegistry::new();
        let (handle, task) = run_operation(&registry, OperationKind::Build, |op| async move {
            op.log("working");
            false
        })
        .unwrap();
        assert_eq!(task.await.unwrap(), OperationStatus::Failure);
        assert_eq!(handle.status(), OperationStatus::Failure);
        assert_eq!(handle.lines(), vec!["working".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_work_still_finishes_record() {
        let registry = OperationRegistry::new();
        let (handle, task) = run_operation(&registry, OperationKind::Deploy, |op| async move {
            op.log("before");
            if op.lines().len() == 1 {
                panic!("worker blew up");
            }
            true
        })
        .unwrap();
        let mut subscription = handle.subscribe();

        assert_eq!(task.await.unwrap(), OperationStatus::Failure);
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(std::time::Duration::from_secs(2), subscription.next())
            .await
            .expect("subscriber must see the end")
        {
            events.push(event);
        }
        assert_eq!(events[0], OperationEvent::Log { line: "before".into() });
        assert_eq!(
            events.last(),
            Some(&OperationEvent::Done {
                success: false,
                cancelled: false
            })
        );
        let done_count = events
            .iter()
            .filter(|e| matches!(e, OperationEvent::Done { .. }))
            .count();
        assert_eq!(done_count, 1);
        assert!(registry.start(OperationKind::Deploy).is_ok());
    }
}
