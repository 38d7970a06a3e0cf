//! Pipeline controller and session state
//!
//! The controller is the only public surface external collaborators call:
//! initialize, play, stop, status, shutdown.

pub mod controller;
pub mod session;

pub use controller::PipelineController;
pub use session::{PipelineSession, PipelineState, PipelineStatus};
