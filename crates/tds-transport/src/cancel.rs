//! Per-stream cancellation bookkeeping.
//!
//! A CANCEL packet makes the server abort whatever it is doing and end the
//! reply with a DONE token carrying the canceled bit, even if nothing was in
//! progress. A new cancel is only allowed once every earlier one has been
//! acknowledged.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct CancelState {
    awaiting_response: bool,
    requested: u64,
    processed: u64,
}

/// Cancellation state of one logical stream.
///
/// Safe to use from any task; `request_cancel` never blocks on I/O.
#[derive(Debug, Default)]
pub struct CancelController {
    state: Mutex<CancelState>,
}

impl CancelController {
    /// Create a controller with no reply outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark that the stream is about to read a server reply.
    pub fn mark_awaiting_response(&self) {
        self.state.lock().awaiting_response = true;
    }

    /// Record a cancel request.
    ///
    /// Returns `true` when the caller should send a CANCEL packet: a reply
    /// is outstanding and no earlier cancel is still unacknowledged.
    /// Otherwise this is a no-op.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.awaiting_response && state.requested == state.processed {
            state.requested += 1;
            true
        } else {
            false
        }
    }

    /// Undo a cancel request whose packet could not be sent.
    pub(crate) fn revoke_cancel(&self) {
        let mut state = self.state.lock();
        if state.requested > state.processed {
            state.requested -= 1;
        }
    }

    /// Called by the task that read the end-of-data marker.
    ///
    /// `was_canceled` is the canceled bit of the marker, `more_results`
    /// whether further result sets follow on the same call.
    pub fn finish_response(&self, was_canceled: bool, more_results: bool) {
        let mut state = self.state.lock();
        if !more_results {
            state.awaiting_response = false;
        }
        if was_canceled && state.processed < state.requested {
            state.processed += 1;
        }
    }

    /// Whether the stream is expecting reply data.
    #[must_use]
    pub fn is_awaiting_response(&self) -> bool {
        self.state.lock().awaiting_response
    }

    /// Cancels sent but not yet acknowledged.
    #[must_use]
    pub fn outstanding_cancels(&self) -> u64 {
        let state = self.state.lock();
        state.requested - state.processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_requires_outstanding_reply() {
        let controller = CancelController::new();
        assert!(!controller.request_cancel());
        assert_eq!(controller.outstanding_cancels(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let controller = CancelController::new();
        controller.mark_awaiting_response();

        assert!(controller.request_cancel());
        assert!(!controller.request_cancel());
        assert_eq!(controller.outstanding_cancels(), 1);

        controller.finish_response(true, false);
        assert_eq!(controller.outstanding_cancels(), 0);
        assert!(!controller.is_awaiting_response());
    }

    #[test]
    fn test_more_results_keeps_awaiting() {
        let controller = CancelController::new();
        controller.mark_awaiting_response();

        controller.finish_response(false, true);
        assert!(controller.is_awaiting_response());
        assert!(controller.request_cancel());

        controller.finish_response(false, true);
        assert_eq!(controller.outstanding_cancels(), 1);
        assert!(!controller.request_cancel());

        controller.finish_response(true, false);
        assert_eq!(controller.outstanding_cancels(), 0);
    }

    #[test]
    fn test_stray_ack_does_not_underflow() {
        let controller = CancelController::new();
        controller.finish_response(true, false);
        assert_eq!(controller.outstanding_cancels(), 0);

        controller.mark_awaiting_response();
        assert!(controller.request_cancel());
        controller.revoke_cancel();
        assert_eq!(controller.outstanding_cancels(), 0);
    }
}
