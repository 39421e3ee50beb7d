use crate::selector::SelectionError;
use sos_proto::{DecodeError, FrameError, RouteError, SessionError};
use sos_router::{SwitchError, SynthesisError};
use thiserror::Error;

/// Failures while handling a packet
///
/// None of these stop the controller; the packet that caused one is
/// consumed and the error logged.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Agent selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("Invalid route: {0}")]
    Route(#[from] RouteError),

    #[error("Invalid session: {0}")]
    Session(#[from] SessionError),

    #[error("Flow synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Switch error: {0}")]
    Switch(#[from] SwitchError),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Unreadable agent report: {0}")]
    Report(#[from] DecodeError),
}
