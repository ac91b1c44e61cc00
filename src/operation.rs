//! Single-flight operation tracking
//!
//! The tracker owns the one process-wide "current operation" slot. Starting an
//! operation while another one holds the slot fails with
//! [`Error::Conflict`]; the check-then-set happens under one mutex so two
//! near-simultaneous requests cannot both win.
//!
//! Cancellation is cooperative: [`OperationTracker::cancel`] only signals the
//! operation's token. The owner observes the token at its next suspension
//! point, cleans up and releases the slot by ending (or dropping) its
//! [`OperationHandle`].

use crate::error::{Error, Result};
use crate::types::{OperationId, OperationKind, OperationSnapshot};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// State shared between the tracker slot and the owning handle
#[derive(Debug)]
struct OperationState {
    id: OperationId,
    kind: Mutex<OperationKind>,
    started_at: DateTime<Utc>,
    token: CancellationToken,
}

impl OperationState {
    fn kind(&self) -> OperationKind {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            kind: self.kind(),
            started_at: self.started_at,
            cancel_requested: self.token.is_cancelled(),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    slot: Mutex<Option<Arc<OperationState>>>,
    next_id: AtomicU64,
}

/// Process-wide record of the operation in flight (cloneable, shared)
#[derive(Clone, Debug, Default)]
pub struct OperationTracker {
    inner: Arc<TrackerInner>,
}

impl OperationTracker {
    /// Create an idle tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<OperationState>>> {
        // A panic while holding the lock cannot leave the Option half-written
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a new operation of `kind`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if an operation already holds the slot. The
    /// existing operation is left untouched.
    pub fn begin(&self, kind: OperationKind) -> Result<OperationHandle> {
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref() {
            tracing::debug!(
                active_id = active.id.0,
                active_kind = %active.kind(),
                requested = %kind,
                "rejecting operation, slot is taken"
            );
            return Err(Error::Conflict {
                active: active.kind(),
            });
        }

        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let state = Arc::new(OperationState {
            id,
            kind: Mutex::new(kind),
            started_at: Utc::now(),
            token: CancellationToken::new(),
        });
        *slot = Some(state.clone());
        drop(slot);

        tracing::info!(operation_id = id.0, kind = %kind, "operation started");

        Ok(OperationHandle {
            state,
            tracker: self.clone(),
            ended: false,
        })
    }

    /// Snapshot of the current operation, if any
    pub fn current(&self) -> Option<OperationSnapshot> {
        self.slot().as_ref().map(|state| state.snapshot())
    }

    /// Whether an operation holds the slot
    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    /// Signal cancellation of the current operation
    ///
    /// Returns the kind of the operation that was signalled, or `None` when
    /// nothing is in progress.
    pub fn cancel(&self) -> Option<OperationKind> {
        let slot = self.slot();
        let state = slot.as_ref()?;
        let kind = state.kind();
        state.token.cancel();
        tracing::info!(operation_id = state.id.0, kind = %kind, "operation cancellation requested");
        Some(kind)
    }

    /// Release the slot if `id` still owns it
    ///
    /// Returns whether the slot was released. A stale id is ignored so a late
    /// owner can never clear an operation begun after its own.
    pub fn end(&self, id: OperationId) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(state) if state.id == id => {
                *slot = None;
                tracing::debug!(operation_id = id.0, "operation ended");
                true
            }
            _ => false,
        }
    }
}

/// Ownership of the current operation
///
/// Dropping the handle ends the operation, so every exit path releases the
/// slot.
#[derive(Debug)]
pub struct OperationHandle {
    state: Arc<OperationState>,
    tracker: OperationTracker,
    ended: bool,
}

impl OperationHandle {
    /// Operation identifier
    pub fn id(&self) -> OperationId {
        self.state.id
    }

    /// Current kind
    pub fn kind(&self) -> OperationKind {
        self.state.kind()
    }

    /// Switch the operation to a new kind (downloading -> uploading)
    pub fn set_kind(&self, kind: OperationKind) {
        let mut current = self.state.kind.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *current;
        if previous != kind {
            *current = kind;
            tracing::debug!(operation_id = self.state.id.0, from = %previous, to = %kind, "operation kind changed");
        }
    }

    /// Cancellation token observed at suspension points
    pub fn token(&self) -> &CancellationToken {
        &self.state.token
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Error describing cancellation of this operation in its current kind
    pub fn cancelled_error(&self) -> Error {
        Error::Cancelled { kind: self.kind() }
    }

    /// Return `Err(Cancelled)` if cancellation has been requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(self.cancelled_error())
        } else {
            Ok(())
        }
    }

    /// End the operation explicitly
    pub fn end(mut self) {
        self.ended = true;
        self.tracker.end(self.state.id);
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if !self.ended {
            self.tracker.end(self.state.id);
        }
    }
}
