//! Crate-level error types for dispatch, time travel, and the test harness.

/// Boxed error returned by host-supplied middleware stages and resolvers.
///
/// String literals convert into it directly: `Err("bad payload".into())`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when dispatching an action fails.
///
/// Only the caller whose own action failed sees this error. Failures of
/// actions queued from inside the drain loop (by middleware stages or
/// [`enqueue`](crate::Store::enqueue)) are logged and dropped instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A middleware stage returned an error.
    ///
    /// The dispatch was aborted before the reducer ran, so no state was
    /// mutated and no subscriber was notified.
    #[error("middleware stage failed on `{action_type}`: {source}")]
    Middleware {
        /// Type of the action that was being processed.
        action_type: String,
        /// The error raised by the stage.
        #[source]
        source: BoxError,
    },

    /// The task running the drain loop was cancelled while this action was
    /// in the middleware pipeline. The action was not applied.
    #[error("dispatch interrupted before the action was applied")]
    Interrupted,
}

/// Error returned by [`TimeTravelRecorder`](crate::TimeTravelRecorder) jumps.
#[derive(Debug, thiserror::Error)]
pub enum TimeTravelError {
    /// The requested log index does not exist.
    #[error("action index {index} out of range (log has {len} entries)")]
    OutOfRange {
        /// The requested index.
        index: usize,
        /// Number of entries in the log at the time of the request.
        len: usize,
    },

    /// Re-dispatching a logged action failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Error returned by [`TestHarness`](crate::TestHarness) operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The requested snapshot index does not exist.
    #[error("snapshot index {index} out of range ({len} snapshots taken)")]
    OutOfRange {
        /// The requested index.
        index: usize,
        /// Number of snapshots taken so far.
        len: usize,
    },

    /// Replay speed must be a positive, finite multiplier.
    #[error("invalid replay speed multiplier: {0}")]
    InvalidSpeed(f64),

    /// Re-dispatching a recorded action failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middleware_error_displays_action_type_and_cause() {
        let err = DispatchError::Middleware {
            action_type: "SAVE".into(),
            source: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "middleware stage failed on `SAVE`: disk full"
        );
    }

    #[test]
    fn middleware_error_exposes_source() {
        use std::error::Error;

        let err = DispatchError::Middleware {
            action_type: "SAVE".into(),
            source: "disk full".into(),
        };
        let source = err.source().expect("source should be set");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn interrupted_display() {
        assert_eq!(
            DispatchError::Interrupted.to_string(),
            "dispatch interrupted before the action was applied"
        );
    }

    #[test]
    fn time_travel_out_of_range_display() {
        let err = TimeTravelError::OutOfRange { index: 4, len: 2 };
        assert_eq!(
            err.to_string(),
            "action index 4 out of range (log has 2 entries)"
        );
    }

    #[test]
    fn harness_out_of_range_display() {
        let err = HarnessError::OutOfRange { index: 1, len: 0 };
        assert_eq!(
            err.to_string(),
            "snapshot index 1 out of range (0 snapshots taken)"
        );
    }

    #[test]
    fn harness_error_from_dispatch_is_transparent() {
        let inner = DispatchError::Middleware {
            action_type: "X".into(),
            source: "boom".into(),
        };
        let err = HarnessError::from(inner);
        assert!(err.to_string().contains("boom"));
    }

    // Errors cross task boundaries (spawned drains, resolver tasks).
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<DispatchError>();
            assert_send_sync::<TimeTravelError>();
            assert_send_sync::<HarnessError>();
        }
    };
}
