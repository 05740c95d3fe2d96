//! Timelapse capture engine: admission, the timed capture loop, incremental
//! persistence and the post-capture pipeline.

pub mod clock;
pub mod session;
pub mod frame_store;
pub mod scheduler;
pub mod archive;
pub mod encoder;
pub mod finalize;
pub mod confirm;
pub mod registry;

pub use registry::{RegistrySettings, TimelapseRegistry};
pub use session::{ProgressSnapshot, SessionHandle, SessionOutcome};
