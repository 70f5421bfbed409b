use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Handles ──────────────────────────────────────────────────

/// Identity of a stored node instance. Assigned on first insertion into the
/// engine data; an instance that was never stored has no handle at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeInstanceHandle(pub u32);

/// Identity of a stored process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessInstanceHandle(pub u32);

impl fmt::Display for NodeInstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ni#{}", self.0)
    }
}

impl fmt::Display for ProcessInstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pi#{}", self.0)
    }
}

/// Owner of a process or node instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Data ─────────────────────────────────────────────────────

/// A named data value produced by a node (result) or fed into one (define).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessData {
    pub name: String,
    pub value: serde_json::Value,
}

impl ProcessData {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

// ─── Node instance state machine ──────────────────────────────

/// Lifecycle state of one node instance.
///
/// `Pending → Sent → Acknowledged → Taken → Started → Complete` is the happy
/// path. `FailRetry` is the only non-terminal failure and re-enters through
/// `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeInstanceState {
    Pending,
    Sent,
    Acknowledged,
    Taken,
    Started,
    Complete,
    Failed,
    FailRetry,
    Cancelled,
    AutoCancelled,
    Skipped,
    SkippedCancel,
    SkippedFail,
    SkippedInvalidated,
}

impl NodeInstanceState {
    pub const ALL: [NodeInstanceState; 14] = [
        Self::Pending,
        Self::Sent,
        Self::Acknowledged,
        Self::Taken,
        Self::Started,
        Self::Complete,
        Self::Failed,
        Self::FailRetry,
        Self::Cancelled,
        Self::AutoCancelled,
        Self::Skipped,
        Self::SkippedCancel,
        Self::SkippedFail,
        Self::SkippedInvalidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Taken => "taken",
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::FailRetry => "fail_retry",
            Self::Cancelled => "cancelled",
            Self::AutoCancelled => "auto_cancelled",
            Self::Skipped => "skipped",
            Self::SkippedCancel => "skipped_cancel",
            Self::SkippedFail => "skipped_fail",
            Self::SkippedInvalidated => "skipped_invalidated",
        }
    }

    /// No further progress is possible from this state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::Failed
                | Self::Cancelled
                | Self::AutoCancelled
                | Self::Skipped
                | Self::SkippedCancel
                | Self::SkippedFail
                | Self::SkippedInvalidated
        )
    }

    /// Somebody has taken responsibility for the task (`Taken..=Complete`).
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Taken | Self::Started | Self::Complete)
    }

    /// The task is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Acknowledged | Self::Taken | Self::Started
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::SkippedCancel | Self::SkippedFail | Self::SkippedInvalidated
        )
    }

    /// Whether `next` may replace `self`.
    ///
    /// Final states only admit idempotent reassignment, invalidation of a
    /// skip, and `Complete → AutoCancelled` (restricted to start nodes by
    /// the caller).
    pub fn can_transition_to(&self, next: NodeInstanceState) -> bool {
        if *self == next || !self.is_final() {
            return true;
        }
        match (self, next) {
            (s, Self::SkippedInvalidated) if s.is_skipped() => true,
            (Self::Complete, Self::AutoCancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Branch decisions ─────────────────────────────────────────

/// Ternary verdict of a branch condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionResult {
    /// Fires now.
    True,
    /// May fire later, or acts as the otherwise fallback.
    Maybe,
    /// Will not fire.
    Never,
}

// ─── Process instance state ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessInstanceState {
    New,
    Initialized,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl ProcessInstanceState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ProcessInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_partition() {
        for state in NodeInstanceState::ALL {
            if state.is_active() {
                assert!(!state.is_final(), "{state} cannot be active and final");
            }
            if state.is_skipped() {
                assert!(state.is_final(), "{state} skip states are final");
            }
        }
        assert!(!NodeInstanceState::FailRetry.is_final());
        assert!(!NodeInstanceState::Pending.is_active());
    }

    #[test]
    fn test_committed_range() {
        let committed: Vec<_> = NodeInstanceState::ALL
            .into_iter()
            .filter(|s| s.is_committed())
            .collect();
        assert_eq!(
            committed,
            vec![
                NodeInstanceState::Taken,
                NodeInstanceState::Started,
                NodeInstanceState::Complete
            ]
        );
    }

    #[test]
    fn test_final_states_only_allow_listed_transitions() {
        use NodeInstanceState::*;
        assert!(Complete.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Started));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Skipped.can_transition_to(SkippedInvalidated));
        assert!(SkippedFail.can_transition_to(SkippedInvalidated));
        assert!(!Cancelled.can_transition_to(SkippedInvalidated));
        assert!(Complete.can_transition_to(AutoCancelled));
        assert!(FailRetry.can_transition_to(Pending));
    }
}
