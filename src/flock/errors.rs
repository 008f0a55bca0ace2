use std::io;

/// A centralized error type for flock lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum FlockError {
    /// The flock has been shut down; no new members may start.
    #[error("flock is shut down")]
    Shutdown,

    /// The flock has been closed; no operations other than queries apply.
    #[error("flock is closed")]
    Closed,

    /// An owner-only operation was called from a thread that does not own
    /// the flock.
    #[error("operation is restricted to the flock owner")]
    NotOwner,

    /// `start` was called from a thread that is neither the owner nor a
    /// current member.
    #[error("caller is neither the owner nor a member of the flock")]
    NotOwnerOrMember,

    /// A timed wait elapsed before membership emptied or a wakeup arrived.
    #[error("timed out waiting for members to finish")]
    Timeout,

    /// The waiting thread was interrupted. Membership bookkeeping is
    /// unaffected; the wait may simply be retried.
    #[error("interrupted while waiting for members to finish")]
    Interrupted,

    /// The flock was closed out of nesting order, or across an ambient
    /// bindings scope. Nested flocks have already been force-closed by the
    /// time this surfaces; nothing leaks.
    #[error("flock closed out of nesting order")]
    StructureViolation,

    /// The OS refused to spawn the member thread. Registration has been
    /// rolled back.
    #[error("failed to spawn member thread: {0}")]
    Spawn(#[from] io::Error),
}

impl FlockError {
    /// Routine outcomes of waiting, as opposed to caller mistakes. A caller
    /// that sees one of these can keep using the flock.
    pub fn is_wait_outcome(&self) -> bool {
        matches!(self, FlockError::Timeout | FlockError::Interrupted)
    }

    /// Errors caused by calling an operation the current state or thread
    /// does not permit. Retrying without fixing the call site cannot help.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            FlockError::Shutdown
                | FlockError::Closed
                | FlockError::NotOwner
                | FlockError::NotOwnerOrMember
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(FlockError::Timeout.is_wait_outcome());
        assert!(FlockError::Interrupted.is_wait_outcome());
        assert!(!FlockError::Shutdown.is_wait_outcome());

        assert!(FlockError::NotOwner.is_usage_error());
        assert!(FlockError::Shutdown.is_usage_error());
        assert!(!FlockError::Timeout.is_usage_error());
        assert!(!FlockError::StructureViolation.is_usage_error());
    }
}
