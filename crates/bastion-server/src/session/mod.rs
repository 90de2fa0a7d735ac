//! Bastion sessions: pipeline stages, credentials, bridging and recording.

pub mod bridge;
pub mod credential;
pub mod pipeline;
pub mod recording;

pub use bridge::splice;
pub use pipeline::{AccountMap, SessionPipeline, SessionStage};
pub use recording::SessionRecorder;
