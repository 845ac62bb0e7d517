//! Transport layer for coordinator ↔ worker communication.
//!
//! Every job runs in its own worker process. The coordinator writes exactly
//! one framed [`ProcessInput`] to the worker's stdin and reads exactly one
//! framed [`ProcessOutput`] back from its stdout.

pub mod process;
pub mod protocol;

pub use process::ProcessLauncher;
pub use protocol::{
    read_frame, write_frame, FrameError, Outcome, ProcessInput, ProcessOutput, MAX_FRAME_LEN,
};
