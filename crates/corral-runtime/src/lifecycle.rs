use crate::types::RuntimeState;
use crate::RuntimeError;

/// Check a lifecycle transition against the runtime state machine.
///
/// `error` is reachable from every non-terminal state. An errored runtime can
/// only move on to `terminating`, so it stays listed until explicitly
/// terminated. Nothing leaves `terminated`.
pub fn validate_transition(from: RuntimeState, to: RuntimeState) -> Result<(), RuntimeError> {
    use RuntimeState::{Creating, Error, Paused, Pending, Running, Terminated, Terminating};

    let valid = matches!(
        (from, to),
        (Pending, Creating)
            | (Creating, Running | Terminating)
            | (Running, Paused | Terminating)
            | (Paused, Running | Terminating)
            | (Terminating, Terminated)
            | (Error, Terminating)
            | (Pending | Creating | Running | Paused | Terminating, Error)
    );

    if valid {
        Ok(())
    } else {
        Err(RuntimeError::configuration(format!(
            "invalid state transition: {from} -> {to}"
        ))
        .with_context("from", from)
        .with_context("to", to))
    }
}
