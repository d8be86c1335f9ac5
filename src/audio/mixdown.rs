//! Mixdown pipeline
//!
//! Turns a set of independently started/ended participant tracks into one
//! synchronized file: probe → normalize → pad to the longest track → mix.

use super::format::AudioFormat;
use super::recorder::TrackSet;
use super::tools::{Invocation, ToolRunner, ToolStep};
use serde::Deserialize;
use serenity::model::id::UserId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No valid audio tracks to mix")]
    NoValidTracks,
    #[error("Required tool not found: {0}")]
    ToolMissing(String),
    #[error("{step} step timed out after {seconds}s")]
    Timeout { step: ToolStep, seconds: u64 },
    #[error("{step} step failed (exit code {code:?}): {stderr}")]
    ProcessFailed {
        step: ToolStep,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Unreadable probe output: {0}")]
    Probe(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output of a completed mixdown
#[derive(Debug, Clone, PartialEq)]
pub struct MixdownResult {
    pub output_path: PathBuf,
    pub file_size_bytes: u64,
    pub duration_seconds: f64,
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct MixdownSettings {
    pub recordings_root: PathBuf,
    pub format: AudioFormat,
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub tool_timeout: Duration,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl MixdownSettings {
    /// Final location of a recording's mixdown
    pub fn output_path(&self, recording_id: i64) -> PathBuf {
        self.recordings_root
            .join(format!("recording_{}.{}", recording_id, self.format.extension()))
    }

    fn channel_layout(&self) -> &'static str {
        if self.channels == 1 {
            "mono"
        } else {
            "stereo"
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// A track that survived probing
#[derive(Debug, Clone)]
struct ProbedTrack {
    participant: UserId,
    path: PathBuf,
    duration: f64,
}

/// Normalizes, synchronizes and mixes captured tracks via ffmpeg
pub struct MixdownPipeline {
    runner: Arc<dyn ToolRunner>,
    settings: MixdownSettings,
}

impl MixdownPipeline {
    pub fn new(runner: Arc<dyn ToolRunner>, settings: MixdownSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &MixdownSettings {
        &self.settings
    }

    /// Mix `tracks` into `<recordings_root>/recording_<id>.<ext>`.
    ///
    /// Intermediate files go into `work_dir`, which the caller owns and removes.
    /// A partially written output file is removed on failure.
    pub async fn mixdown(
        &self,
        recording_id: i64,
        tracks: &TrackSet,
        work_dir: &Path,
    ) -> Result<MixdownResult, PipelineError> {
        info!(
            "Processing recording {} with {} track(s)",
            recording_id,
            tracks.len()
        );

        let probed = self.probe_tracks(tracks).await?;
        if probed.is_empty() {
            return Err(PipelineError::NoValidTracks);
        }

        let mut normalized = Vec::with_capacity(probed.len());
        for track in &probed {
            normalized.push(self.normalize(track, work_dir).await?);
        }

        let target = normalized
            .iter()
            .map(|t| t.duration)
            .fold(0.0_f64, f64::max);

        let mut synchronized = Vec::with_capacity(normalized.len());
        for track in &normalized {
            synchronized.push(self.pad_to(track, target, work_dir).await?);
        }

        let output = self.settings.output_path(recording_id);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.mix(&synchronized, &output).await {
            discard_partial(&output).await;
            return Err(e);
        }

        let file_size_bytes = match tokio::fs::metadata(&output).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard_partial(&output).await;
                return Err(e.into());
            }
        };

        info!(
            "Recording {} processed: {:?} ({} bytes, {:.1}s)",
            recording_id, output, file_size_bytes, target
        );

        Ok(MixdownResult {
            output_path: output,
            file_size_bytes,
            duration_seconds: target,
        })
    }

    async fn probe_tracks(&self, tracks: &TrackSet) -> Result<Vec<ProbedTrack>, PipelineError> {
        let mut probed = Vec::new();

        for (participant, path) in tracks {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() > 0 => {}
                Ok(_) => {
                    warn!("Skipping empty track for user {}: {:?}", participant, path);
                    continue;
                }
                Err(_) => {
                    warn!("Skipping missing track for user {}: {:?}", participant, path);
                    continue;
                }
            }

            match self.probe_duration(path).await {
                Ok(duration) if duration > 0.0 => probed.push(ProbedTrack {
                    participant: *participant,
                    path: path.clone(),
                    duration,
                }),
                Ok(_) => warn!("Skipping silent track for user {}: {:?}", participant, path),
                Err(e @ (PipelineError::ToolMissing(_) | PipelineError::Timeout { .. })) => {
                    return Err(e)
                }
                Err(e) => warn!("Skipping unreadable track for user {}: {}", participant, e),
            }
        }

        Ok(probed)
    }

    /// Duration in seconds as reported by ffprobe
    async fn probe_duration(&self, path: &Path) -> Result<f64, PipelineError> {
        let invocation = Invocation::new(
            ToolStep::Probe,
            &self.settings.ffprobe,
            self.settings.tool_timeout,
        )
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path_arg(path));

        let output = self.runner.run(&invocation).await?;
        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Probe(e.to_string()))?;

        parsed
            .format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite())
            .ok_or_else(|| PipelineError::Probe(format!("no duration for {:?}", path)))
    }

    async fn normalize(
        &self,
        track: &ProbedTrack,
        work_dir: &Path,
    ) -> Result<ProbedTrack, PipelineError> {
        let output = work_dir.join(format!("user_{}_normalized.wav", track.participant.get()));

        let invocation = Invocation::new(
            ToolStep::Normalize,
            &self.settings.ffmpeg,
            self.settings.tool_timeout,
        )
        .arg("-i")
        .arg(path_arg(&track.path))
        .args(["-ar", &self.settings.sample_rate.to_string()])
        .args(["-ac", &self.settings.channels.to_string()])
        .args(["-acodec", "pcm_s16le", "-y"])
        .arg(path_arg(&output));

        self.runner.run(&invocation).await?;
        debug!("Normalized track for user {}", track.participant);

        Ok(ProbedTrack {
            path: output,
            ..track.clone()
        })
    }

    /// Append trailing silence so the track lasts `target` seconds.
    /// Tracks already at or past the target are returned untouched.
    async fn pad_to(
        &self,
        track: &ProbedTrack,
        target: f64,
        work_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        if track.duration >= target {
            return Ok(track.path.clone());
        }

        let silence = target - track.duration;
        let output = work_dir.join(format!("sync_user_{}.wav", track.participant.get()));
        let source = format!(
            "anullsrc=channel_layout={}:sample_rate={}:duration={:.3}",
            self.settings.channel_layout(),
            self.settings.sample_rate,
            silence
        );

        let invocation =
            Invocation::new(ToolStep::Pad, &self.settings.ffmpeg, self.settings.tool_timeout)
                .arg("-i")
                .arg(path_arg(&track.path))
                .args(["-f", "lavfi", "-i"])
                .arg(source)
                .args([
                    "-filter_complex",
                    "[0:a][1:a]concat=n=2:v=0:a=1[out]",
                    "-map",
                    "[out]",
                    "-y",
                ])
                .arg(path_arg(&output));

        self.runner.run(&invocation).await?;
        debug!(
            "Padded track for user {} with {:.3}s of silence",
            track.participant, silence
        );
        Ok(output)
    }

    async fn mix(&self, inputs: &[PathBuf], output: &Path) -> Result<(), PipelineError> {
        let step = if inputs.len() == 1 {
            ToolStep::Transcode
        } else {
            ToolStep::Mix
        };

        let mut invocation =
            Invocation::new(step, &self.settings.ffmpeg, self.settings.tool_timeout);
        for input in inputs {
            invocation = invocation.arg("-i").arg(path_arg(input));
        }

        if inputs.len() > 1 {
            let labels: String = (0..inputs.len()).map(|i| format!("[{}:a]", i)).collect();
            invocation = invocation
                .arg("-filter_complex")
                .arg(format!(
                    "{}amix=inputs={}:duration=longest:dropout_transition=0[out]",
                    labels,
                    inputs.len()
                ))
                .args(["-map", "[out]"]);
        }

        invocation = invocation.args(["-acodec", self.settings.format.codec()]);
        if self.settings.format.uses_bitrate() {
            invocation = invocation.args(["-b:a", self.settings.bitrate.as_str()]);
        }
        invocation = invocation.arg("-y").arg(path_arg(output));

        self.runner.run(&invocation).await.map(|_| ()).map_err(|e| {
            error!("Audio {} failed for {:?}: {}", step, output, e);
            e
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn discard_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!("Removed partial output {:?}", output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {:?}: {}", output, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_track, FakeRunner};
    use tempfile::tempdir;

    fn settings(root: &Path) -> MixdownSettings {
        MixdownSettings {
            recordings_root: root.to_path_buf(),
            format: AudioFormat::Mp3,
            bitrate: "192k".to_string(),
            sample_rate: 48000,
            channels: 2,
            tool_timeout: Duration::from_secs(60),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pads_short_track_and_mixes_all() {
        let temp = tempdir().unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let runner = Arc::new(
            FakeRunner::new()
                .with_duration("user_101", 90.0)
                .with_duration("user_202", 30.0)
                .with_duration("user_303", 90.0),
        );
        let pipeline = MixdownPipeline::new(runner.clone(), settings(temp.path()));

        let mut tracks = TrackSet::new();
        for id in [101, 202, 303] {
            tracks.insert(UserId::new(id), write_track(temp.path(), id));
        }

        let result = pipeline.mixdown(5, &tracks, &work).await.unwrap();
        assert_eq!(result.output_path, temp.path().join("recording_5.mp3"));
        assert_eq!(result.duration_seconds, 90.0);
        assert!(result.file_size_bytes > 0);

        assert_eq!(runner.count(ToolStep::Probe), 3);
        assert_eq!(runner.count(ToolStep::Normalize), 3);

        let pads = runner.invocations_for(ToolStep::Pad);
        assert_eq!(pads.len(), 1);
        assert!(pads[0].args.iter().any(|a| a.contains("user_202_normalized.wav")));
        assert!(pads[0].args.iter().any(|a| a.contains("duration=60.000")));

        let mixes = runner.invocations_for(ToolStep::Mix);
        assert_eq!(mixes.len(), 1);
        let mix_args = mixes[0].args.join(" ");
        assert!(mix_args.contains("amix=inputs=3:duration=longest:dropout_transition=0"));
        assert!(mix_args.contains("user_101_normalized.wav"));
        assert!(mix_args.contains("sync_user_202.wav"));
        assert!(mix_args.contains("user_303_normalized.wav"));
        assert!(mix_args.contains("-b:a 192k"));
    }

    #[tokio::test]
    async fn test_longest_track_is_not_rewritten() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(
            FakeRunner::new()
                .with_duration("user_1", 42.0)
                .with_duration("user_2", 10.0),
        );
        let pipeline = MixdownPipeline::new(runner.clone(), settings(temp.path()));

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(1), write_track(temp.path(), 1));
        tracks.insert(UserId::new(2), write_track(temp.path(), 2));

        pipeline.mixdown(1, &tracks, temp.path()).await.unwrap();

        let normalized = temp.path().join("user_1_normalized.wav");
        let before = std::fs::read(&normalized).unwrap();

        let pads = runner.invocations_for(ToolStep::Pad);
        assert_eq!(pads.len(), 1);
        assert!(!pads[0].args.join(" ").contains("user_1_normalized.wav"));
        assert!(!temp.path().join("sync_user_1.wav").exists());
        assert_eq!(std::fs::read(&normalized).unwrap(), before);
    }

    #[tokio::test]
    async fn test_single_track_skips_mix_filter() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new().with_duration("user_9", 12.5));
        let pipeline = MixdownPipeline::new(runner.clone(), settings(temp.path()));

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(9), write_track(temp.path(), 9));

        let result = pipeline.mixdown(2, &tracks, temp.path()).await.unwrap();
        assert_eq!(result.duration_seconds, 12.5);

        assert_eq!(runner.count(ToolStep::Mix), 0);
        assert_eq!(runner.count(ToolStep::Pad), 0);
        let transcodes = runner.invocations_for(ToolStep::Transcode);
        assert_eq!(transcodes.len(), 1);
        assert!(!transcodes[0].args.iter().any(|a| a.contains("amix")));
        assert!(!transcodes[0].args.iter().any(|a| a == "-filter_complex"));
    }

    #[tokio::test]
    async fn test_missing_and_unprobeable_tracks_are_skipped() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new().with_duration("user_1", 20.0));
        let pipeline = MixdownPipeline::new(runner.clone(), settings(temp.path()));

        let empty = temp.path().join("user_3.wav");
        std::fs::write(&empty, b"").unwrap();

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(1), write_track(temp.path(), 1));
        tracks.insert(UserId::new(2), write_track(temp.path(), 2)); // no scripted duration
        tracks.insert(UserId::new(3), empty);
        tracks.insert(UserId::new(4), temp.path().join("user_4.wav"));

        let result = pipeline.mixdown(3, &tracks, temp.path()).await.unwrap();
        assert_eq!(result.duration_seconds, 20.0);
        assert_eq!(runner.count(ToolStep::Probe), 2);
        assert_eq!(runner.count(ToolStep::Normalize), 1);
        assert_eq!(runner.count(ToolStep::Transcode), 1);
    }

    #[tokio::test]
    async fn test_no_valid_tracks() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let pipeline = MixdownPipeline::new(runner.clone(), settings(temp.path()));

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(1), temp.path().join("gone.wav"));

        let err = pipeline.mixdown(4, &tracks, temp.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoValidTracks));
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_tool_missing_aborts() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::missing_tools());
        let pipeline = MixdownPipeline::new(runner, settings(temp.path()));

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(1), write_track(temp.path(), 1));

        let err = pipeline.mixdown(6, &tracks, temp.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolMissing(_)));
    }

    #[tokio::test]
    async fn test_failed_mix_discards_partial_output() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(
            FakeRunner::new()
                .with_duration("user_1", 5.0)
                .with_duration("user_2", 5.0)
                .failing_on(ToolStep::Mix),
        );
        let pipeline = MixdownPipeline::new(runner, settings(temp.path()));

        let mut tracks = TrackSet::new();
        tracks.insert(UserId::new(1), write_track(temp.path(), 1));
        tracks.insert(UserId::new(2), write_track(temp.path(), 2));

        let err = pipeline.mixdown(8, &tracks, temp.path()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ProcessFailed {
                step: ToolStep::Mix,
                ..
            }
        ));
        assert!(!temp.path().join("recording_8.mp3").exists());
    }
}
