//! Multi-connection download engine.
//!
//! Accepts download jobs and drives them to completion over concurrent HTTP
//! byte-range connections, with on-disk resume, aggregate rate limiting,
//! dead-link refresh, and HLS/DASH post-processing through an external muxer.
//!
//! Entry point: [`brain::Engine::spawn`] with an [`config::EngineConfig`],
//! an [`extractor::InfoExtractor`] and a [`muxer::MediaMuxer`].

pub mod assembler;
pub mod brain;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod job;
pub mod limiter;
pub mod logging;
pub mod muxer;
pub mod probe;
pub mod retry;
pub mod store;
pub mod transport;
pub mod url_model;
pub mod video;
pub mod worker;

pub use brain::Engine;
pub use config::EngineConfig;
pub use error::{ErrorKind, JobError};
pub use events::{EngineEvent, EventBus, Observer};
pub use job::{DownloadSpec, JobId, JobSnapshot, JobStatus};
