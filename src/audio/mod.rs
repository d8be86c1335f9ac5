//! Audio module for capture and mixdown
//!
//! Per-participant tracks are captured as WAV and merged with ffmpeg

pub mod format;
pub mod mixdown;
pub mod recorder;
pub mod tools;
pub mod workdir;

pub use format::AudioFormat;
pub use mixdown::{MixdownPipeline, MixdownResult, MixdownSettings, PipelineError};
pub use recorder::{CaptureError, CaptureFormat, TrackCapture, TrackSet};
pub use tools::{SystemRunner, ToolStep};
pub use workdir::WorkDir;
