//! Watch events - the change notifications delivered for every resource kind.

use nodepool_id::ObjectKey;
use serde::{Deserialize, Serialize};

use crate::meta::Resource;

/// The kind of change a watch event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Generic,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

/// A change notification for a single object.
///
/// Delivery is at-least-once: consumers must tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent<K> {
    /// The object was observed for the first time.
    Created(K),

    /// The object changed from `old` to `new`.
    Updated { old: K, new: K },

    /// The object is gone; carries its last known state.
    Deleted(K),

    /// A synthetic event not tied to a specific change.
    Generic(K),
}

impl<K: Resource> WatchEvent<K> {
    pub fn kind(&self) -> EventKind {
        match self {
            WatchEvent::Created(_) => EventKind::Created,
            WatchEvent::Updated { .. } => EventKind::Updated,
            WatchEvent::Deleted(_) => EventKind::Deleted,
            WatchEvent::Generic(_) => EventKind::Generic,
        }
    }

    /// The most recent state carried by the event.
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Created(obj) | WatchEvent::Deleted(obj) | WatchEvent::Generic(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }

    /// The previous state, only present on updates.
    pub fn old(&self) -> Option<&K> {
        match self {
            WatchEvent::Updated { old, .. } => Some(old),
            _ => None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Machine, MachinePhase};

    fn machine(phase: MachinePhase) -> Machine {
        let mut m = Machine::new("shoot--a", "m-1", "set-a");
        m.status.phase = phase;
        m
    }

    #[test]
    fn test_object_is_newest_state() {
        let event = WatchEvent::Updated {
            old: machine(MachinePhase::Pending),
            new: machine(MachinePhase::Ready),
        };

        assert_eq!(event.kind(), EventKind::Updated);
        assert_eq!(event.object().status.phase, MachinePhase::Ready);
        assert_eq!(event.old().map(|m| m.status.phase), Some(MachinePhase::Pending));
        assert_eq!(event.key(), ObjectKey::new("shoot--a", "m-1"));
    }

    #[test]
    fn test_non_update_has_no_old() {
        let event = WatchEvent::Deleted(machine(MachinePhase::Terminating));
        assert!(event.old().is_none());
        assert_eq!(event.kind().to_string(), "deleted");
    }
}
