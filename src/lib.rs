//! Renders frames with OpenGL ES into GBM buffers and presents them on a
//! DRM/KMS output, with legacy or atomic page flipping.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod present;
pub mod render;
pub mod scheduler;

pub use config::Config;
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{Pipeline, RunOptions};
