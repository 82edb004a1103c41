//! The synchronization status machine and its event feeds.

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use usersync_protocol::{same_conflicts, Conflict, SyncResource};

/// The observable status of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not syncing. The initial state.
    Idle,
    /// A sync cycle is in flight.
    Syncing,
    /// A preview produced conflicts that await resolution.
    HasConflicts,
}

impl SyncStatus {
    /// Returns true if a new sync cycle may start from this status.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncStatus::Idle)
    }

    /// Returns true if `self -> to` is one of the allowed transitions.
    pub fn can_transition_to(&self, to: SyncStatus) -> bool {
        matches!(
            (self, to),
            (SyncStatus::Idle, SyncStatus::Syncing)
                | (SyncStatus::Syncing, SyncStatus::Idle)
                | (SyncStatus::Syncing, SyncStatus::HasConflicts)
                | (SyncStatus::HasConflicts, SyncStatus::Syncing)
                | (SyncStatus::HasConflicts, SyncStatus::Idle)
        )
    }
}

/// A broadcast feed distributing values to subscribers.
///
/// Delivery is synchronous and best-effort; subscribers that dropped their
/// receiver are pruned on the next emission.
#[derive(Debug)]
pub struct EventFeed<T: Clone> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> EventFeed<T> {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends a value to every live subscriber.
    pub fn emit(&self, value: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }
}

impl<T: Clone> Default for EventFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TrackerState {
    status: SyncStatus,
    conflicts: Vec<Conflict>,
}

/// Owns the status cell, the conflict list, and their event feeds.
///
/// The conflict list is non-empty exactly while the status is
/// `HasConflicts`; any exit from `HasConflicts` clears it. Conflict events
/// fire before the status event, so observers of a status change always see
/// the conflict list already updated.
#[derive(Debug)]
pub struct StatusTracker {
    resource: SyncResource,
    state: Mutex<TrackerState>,
    status_feed: EventFeed<SyncStatus>,
    conflicts_feed: EventFeed<Vec<Conflict>>,
}

impl StatusTracker {
    /// Creates a tracker in the `Idle` state.
    pub fn new(resource: SyncResource) -> Self {
        Self {
            resource,
            state: Mutex::new(TrackerState {
                status: SyncStatus::Idle,
                conflicts: Vec::new(),
            }),
            status_feed: EventFeed::new(),
            conflicts_feed: EventFeed::new(),
        }
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    /// Current conflict list.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.state.lock().conflicts.clone()
    }

    /// Subscribes to status changes. Exactly one event per transition;
    /// equal-status sets are silent.
    pub fn subscribe_status(&self) -> UnboundedReceiver<SyncStatus> {
        self.status_feed.subscribe()
    }

    /// Subscribes to conflict-list replacements.
    pub fn subscribe_conflicts(&self) -> UnboundedReceiver<Vec<Conflict>> {
        self.conflicts_feed.subscribe()
    }

    /// Replaces the conflict list if any pair changed.
    pub fn set_conflicts(&self, conflicts: Vec<Conflict>) {
        let changed = {
            let mut state = self.state.lock();
            if same_conflicts(&state.conflicts, &conflicts) {
                false
            } else {
                state.conflicts = conflicts.clone();
                true
            }
        };
        if changed {
            self.conflicts_feed.emit(conflicts);
        }
    }

    /// Moves to a new status, emitting the change events.
    pub fn set_status(&self, status: SyncStatus) {
        let conflicts_cleared = {
            let mut state = self.state.lock();
            if state.status == status {
                return;
            }
            let leaving_conflicts =
                state.status == SyncStatus::HasConflicts && !state.conflicts.is_empty();
            if leaving_conflicts {
                state.conflicts.clear();
            }
            if state.status == SyncStatus::HasConflicts && status == SyncStatus::Idle {
                tracing::info!(resource = %self.resource, "conflicts resolved");
            }
            if status == SyncStatus::HasConflicts {
                tracing::info!(resource = %self.resource, "conflicts detected");
            }
            state.status = status;
            leaving_conflicts
        };
        if conflicts_cleared {
            self.conflicts_feed.emit(Vec::new());
        }
        self.status_feed.emit(status);
    }

    /// Enters `Syncing` if and only if currently `Idle`.
    pub fn try_start(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != SyncStatus::Idle {
                return false;
            }
            state.status = SyncStatus::Syncing;
        }
        self.status_feed.emit(SyncStatus::Syncing);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn conflict(n: u32) -> Conflict {
        Conflict::new(
            Url::parse(&format!("user-data-sync://preview/local/{n}")).unwrap(),
            Url::parse(&format!("user-data-sync://preview/remote/{n}")).unwrap(),
        )
    }

    fn drain(rx: &mut UnboundedReceiver<SyncStatus>) -> Vec<SyncStatus> {
        let mut out = Vec::new();
        while let Ok(status) = rx.try_recv() {
            out.push(status);
        }
        out
    }

    #[test]
    fn allowed_transitions() {
        assert!(SyncStatus::Idle.can_transition_to(SyncStatus::Syncing));
        assert!(SyncStatus::Syncing.can_transition_to(SyncStatus::HasConflicts));
        assert!(SyncStatus::HasConflicts.can_transition_to(SyncStatus::Syncing));
        assert!(SyncStatus::HasConflicts.can_transition_to(SyncStatus::Idle));
        assert!(!SyncStatus::Idle.can_transition_to(SyncStatus::HasConflicts));
        assert!(!SyncStatus::Idle.can_transition_to(SyncStatus::Idle));
    }

    #[test]
    fn every_transition_emits_exactly_one_event() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        let mut rx = tracker.subscribe_status();

        tracker.set_status(SyncStatus::Syncing);
        tracker.set_status(SyncStatus::Idle);
        assert_eq!(drain(&mut rx), vec![SyncStatus::Syncing, SyncStatus::Idle]);
    }

    #[test]
    fn equal_status_set_is_silent() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        let mut rx = tracker.subscribe_status();

        tracker.set_status(SyncStatus::Syncing);
        tracker.set_status(SyncStatus::Syncing);
        assert_eq!(drain(&mut rx), vec![SyncStatus::Syncing]);
    }

    #[test]
    fn leaving_conflicts_clears_the_list() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        tracker.set_status(SyncStatus::Syncing);
        tracker.set_conflicts(vec![conflict(1)]);
        tracker.set_status(SyncStatus::HasConflicts);
        assert_eq!(tracker.conflicts().len(), 1);

        tracker.set_status(SyncStatus::Idle);
        assert!(tracker.conflicts().is_empty());
    }

    #[test]
    fn conflict_event_precedes_status_event() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        let mut conflicts_rx = tracker.subscribe_conflicts();
        let mut status_rx = tracker.subscribe_status();

        tracker.set_status(SyncStatus::Syncing);
        let _ = status_rx.try_recv();

        tracker.set_conflicts(vec![conflict(1)]);
        tracker.set_status(SyncStatus::HasConflicts);

        // By the time the status event is observable, the conflict list is set.
        assert_eq!(conflicts_rx.try_recv().unwrap().len(), 1);
        assert_eq!(status_rx.try_recv().unwrap(), SyncStatus::HasConflicts);
    }

    #[test]
    fn unchanged_conflict_list_is_silent() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        let mut rx = tracker.subscribe_conflicts();
        tracker.set_conflicts(vec![conflict(1)]);
        tracker.set_conflicts(vec![conflict(1)]);
        assert_eq!(rx.try_recv().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn try_start_gates_on_idle() {
        let tracker = StatusTracker::new(SyncResource::Settings);
        assert!(tracker.try_start());
        assert!(!tracker.try_start());
        tracker.set_status(SyncStatus::Idle);
        assert!(tracker.try_start());
    }
}
