//! Per-participant track capture
//!
//! Receives decoded Discord voice frames and writes each participant's
//! stream to its own WAV file. A single writer task owns every file; the
//! voice receive path only sends it messages.

use hound::{SampleFormat, WavSpec, WavWriter};
use serenity::model::id::UserId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Capture already finished")]
    Closed,
}

/// Finished tracks, ordered by participant for deterministic mixing
pub type TrackSet = BTreeMap<UserId, PathBuf>;

/// PCM layout of captured frames
#[derive(Debug, Clone, Copy)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureFormat {
    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }
}

enum CaptureCommand {
    Frame { participant: UserId, samples: Vec<i16> },
    Silence { participant: UserId, samples: usize },
    Finish(oneshot::Sender<TrackSet>),
}

/// Handle to a running capture
pub struct TrackCapture {
    tx: mpsc::UnboundedSender<CaptureCommand>,
    format: CaptureFormat,
}

impl TrackCapture {
    /// Start a capture writing into `dir`. Must be called inside a Tokio runtime.
    pub fn start<P: AsRef<Path>>(dir: P, format: CaptureFormat) -> Result<Self, CaptureError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        info!("Started track capture in {:?}", dir);
        let writer = TrackWriter {
            dir,
            spec: format.wav_spec(),
            tracks: HashMap::new(),
            broken: HashSet::new(),
        };
        tokio::spawn(writer.run(rx));

        Ok(Self { tx, format })
    }

    /// Interleaved samples in one 20ms voice tick
    pub fn tick_samples(&self) -> usize {
        (self.format.sample_rate / 50) as usize * self.format.channels as usize
    }

    /// Append interleaved PCM for a participant
    pub fn push_frame(&self, participant: UserId, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        // Frames arriving after finish() are dropped.
        let _ = self.tx.send(CaptureCommand::Frame {
            participant,
            samples: samples.to_vec(),
        });
    }

    /// Append silence for a participant who already has a track.
    ///
    /// Keeps a track's timeline continuous while its speaker is quiet.
    pub fn push_silence(&self, participant: UserId, samples: usize) {
        if samples == 0 {
            return;
        }
        let _ = self.tx.send(CaptureCommand::Silence {
            participant,
            samples,
        });
    }

    /// Signal capture end and wait for the finished track set
    pub async fn finish(&self) -> Result<TrackSet, CaptureError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(CaptureCommand::Finish(reply))
            .map_err(|_| CaptureError::Closed)?;
        done.await.map_err(|_| CaptureError::Closed)
    }
}

struct Track {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    samples: u64,
}

struct TrackWriter {
    dir: PathBuf,
    spec: WavSpec,
    tracks: HashMap<UserId, Track>,
    broken: HashSet<UserId>,
}

impl TrackWriter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CaptureCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                CaptureCommand::Frame {
                    participant,
                    samples,
                } => self.write(participant, samples.iter().copied()),
                CaptureCommand::Silence {
                    participant,
                    samples,
                } => {
                    if self.tracks.contains_key(&participant) {
                        self.write(participant, std::iter::repeat(0i16).take(samples));
                    }
                }
                CaptureCommand::Finish(reply) => {
                    let tracks = self.finalize();
                    let _ = reply.send(tracks);
                    return;
                }
            }
        }

        // Every handle dropped without finish(); still leave valid files behind.
        self.finalize();
    }

    fn write<I: Iterator<Item = i16>>(&mut self, participant: UserId, samples: I) {
        if self.broken.contains(&participant) {
            return;
        }

        if !self.tracks.contains_key(&participant) {
            let path = self.dir.join(format!("user_{}.wav", participant.get()));
            match WavWriter::create(&path, self.spec) {
                Ok(writer) => {
                    info!("Started track for user {} at {:?}", participant, path);
                    self.tracks.insert(
                        participant,
                        Track {
                            path,
                            writer,
                            samples: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!("Failed to create track for user {}: {}", participant, e);
                    self.broken.insert(participant);
                    return;
                }
            }
        }

        let Some(track) = self.tracks.get_mut(&participant) else {
            return;
        };
        for sample in samples {
            if let Err(e) = track.writer.write_sample(sample) {
                warn!("Dropping track for user {}: {}", participant, e);
                if let Some(track) = self.tracks.remove(&participant) {
                    let _ = fs::remove_file(&track.path);
                }
                self.broken.insert(participant);
                return;
            }
            track.samples += 1;
        }
    }

    fn finalize(&mut self) -> TrackSet {
        let mut finished = TrackSet::new();

        for (participant, track) in self.tracks.drain() {
            let Track {
                path,
                writer,
                samples,
            } = track;

            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize track for user {}: {}", participant, e);
                let _ = fs::remove_file(&path);
                continue;
            }
            if samples == 0 {
                debug!("Discarding empty track for user {}", participant);
                let _ = fs::remove_file(&path);
                continue;
            }
            finished.insert(participant, path);
        }

        info!("Capture finished with {} track(s)", finished.len());
        finished
    }
}
