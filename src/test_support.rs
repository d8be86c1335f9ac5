//! Shared fakes for unit tests

use crate::audio::mixdown::PipelineError;
use crate::audio::tools::{Invocation, ToolOutput, ToolRunner, ToolStep};
use crate::audio::TrackCapture;
use crate::notify::{CompletedNotice, FailedNotice, Notifier};
use crate::voice::{GatewayError, VoiceGateway};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::all::{ChannelId, GuildId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Write a non-empty stand-in for a captured track
pub fn write_track(dir: &Path, user_id: u64) -> PathBuf {
    let path = dir.join(format!("user_{}.wav", user_id));
    std::fs::write(&path, b"RIFF fake track").unwrap();
    path
}

/// Scripted stand-in for ffmpeg/ffprobe.
///
/// Probes answer from a table keyed by file stem; every other step writes a
/// small file at its output path (the last argument).
#[derive(Default)]
pub struct FakeRunner {
    durations: HashMap<String, f64>,
    failing: Option<ToolStep>,
    delays: Vec<(ToolStep, Duration)>,
    missing: bool,
    log: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation reports the binary as missing
    pub fn missing_tools() -> Self {
        Self {
            missing: true,
            ..Self::default()
        }
    }

    /// Probe result for files whose stem is `key` or starts with `key_`
    pub fn with_duration(mut self, key: &str, seconds: f64) -> Self {
        self.durations.insert(key.to_string(), seconds);
        self
    }

    /// `step` writes its output, then exits non-zero
    pub fn failing_on(mut self, step: ToolStep) -> Self {
        self.failing = Some(step);
        self
    }

    /// `step` takes `delay` before doing anything
    pub fn with_delay(mut self, step: ToolStep, delay: Duration) -> Self {
        self.delays.push((step, delay));
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().clone()
    }

    pub fn invocations_for(&self, step: ToolStep) -> Vec<Invocation> {
        self.log
            .lock()
            .iter()
            .filter(|i| i.step == step)
            .cloned()
            .collect()
    }

    pub fn count(&self, step: ToolStep) -> usize {
        self.invocations_for(step).len()
    }

    fn probe(&self, invocation: &Invocation) -> Result<ToolOutput, PipelineError> {
        let stem = invocation
            .args
            .last()
            .and_then(|p| Path::new(p).file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let duration = self.durations.iter().find_map(|(key, seconds)| {
            (stem == *key || stem.starts_with(&format!("{}_", key))).then_some(*seconds)
        });

        match duration {
            Some(seconds) => Ok(ToolOutput {
                stdout: format!(r#"{{"format":{{"duration":"{:.6}"}}}}"#, seconds).into_bytes(),
            }),
            None => Err(PipelineError::ProcessFailed {
                step: ToolStep::Probe,
                code: Some(1),
                stderr: format!("{}: Invalid data found when processing input", stem),
            }),
        }
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput, PipelineError> {
        self.log.lock().push(invocation.clone());

        if self.missing {
            return Err(PipelineError::ToolMissing(invocation.program.clone()));
        }

        let delay = self
            .delays
            .iter()
            .find(|(step, _)| *step == invocation.step)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if invocation.step == ToolStep::Probe {
            return self.probe(invocation);
        }

        if let Some(output) = invocation.args.last() {
            std::fs::write(output, b"fake audio")?;
        }

        if self.failing == Some(invocation.step) {
            return Err(PipelineError::ProcessFailed {
                step: invocation.step,
                code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }

        Ok(ToolOutput::default())
    }
}

/// Gateway that remembers the capture it was handed
#[derive(Default)]
pub struct FakeGateway {
    fail_connect: bool,
    captures: Mutex<HashMap<GuildId, Arc<TrackCapture>>>,
    connects: Mutex<Vec<(GuildId, ChannelId)>>,
    disconnects: Mutex<Vec<GuildId>>,
}

impl FakeGateway {
    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    pub fn capture(&self, guild_id: GuildId) -> Arc<TrackCapture> {
        self.captures.lock()[&guild_id].clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.lock().len()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        capture: Arc<TrackCapture>,
    ) -> Result<(), GatewayError> {
        if self.fail_connect {
            return Err(GatewayError::Join("Missing Permissions".to_string()));
        }
        self.connects.lock().push((guild_id, channel_id));
        self.captures.lock().insert(guild_id, capture);
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), GatewayError> {
        self.disconnects.lock().push(guild_id);
        self.captures.lock().remove(&guild_id);
        Ok(())
    }
}

/// Notifier that keeps every notice
#[derive(Default)]
pub struct RecordingNotifier {
    completed: Mutex<Vec<CompletedNotice>>,
    failed: Mutex<Vec<FailedNotice>>,
}

impl RecordingNotifier {
    pub fn completed(&self) -> Vec<CompletedNotice> {
        self.completed.lock().clone()
    }

    pub fn failed(&self) -> Vec<FailedNotice> {
        self.failed.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn recording_completed(&self, notice: &CompletedNotice) {
        self.completed.lock().push(notice.clone());
    }

    async fn recording_failed(&self, notice: &FailedNotice) {
        self.failed.lock().push(notice.clone());
    }
}
