//! Configuration management for VoiceScribe
//!
//! Loads settings from environment variables (.env file)

use crate::audio::AudioFormat;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: String,
    /// Optional guild ID for development (faster command sync)
    pub guild_id: Option<u64>,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Root directory for finished recordings
    pub recordings_path: PathBuf,
    /// Root for per-recording working directories
    pub temp_audio_dir: PathBuf,
    /// HTTP bind host
    pub web_host: String,
    /// HTTP bind port
    pub web_port: u16,
    /// Base URL used when building download links
    pub public_base_url: String,
    /// Output container
    pub audio_format: AudioFormat,
    /// Output bitrate passed to ffmpeg (`-b:a`)
    pub audio_quality: String,
    /// Audio sample rate (Discord uses 48kHz)
    pub sample_rate: u32,
    /// Audio channels (Discord uses stereo)
    pub channels: u16,
    /// Upper bound for a single ffmpeg/ffprobe invocation
    pub tool_timeout: Duration,
    /// Recordings are stopped automatically after this long
    pub max_recording_duration: Option<Duration>,
    /// Lifetime of a download link
    pub download_ttl: Duration,
    /// Retire download tokens on first use
    pub single_use_downloads: bool,
    /// How often expired tokens are purged
    pub token_cleanup_interval: Duration,
    /// Bounded wait for in-flight sessions during shutdown
    pub shutdown_timeout: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let discord_token = get("DISCORD_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

        let guild_id = get("GUILD_ID")
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue("GUILD_ID".to_string(), s))
            })
            .transpose()?;

        let web_port: u16 = parse_or(&get, "WEB_SERVER_PORT", 8000)?;
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", web_port))
            .trim_end_matches('/')
            .to_string();

        let audio_format = match get("AUDIO_FORMAT") {
            Some(s) => AudioFormat::from_str(&s)
                .ok_or_else(|| ConfigError::InvalidValue("AUDIO_FORMAT".to_string(), s))?,
            None => AudioFormat::Mp3,
        };

        let max_recording_secs: u64 = parse_or(&get, "MAX_RECORDING_DURATION", 7200)?;

        Ok(Self {
            discord_token,
            guild_id,
            database_path: get("DATABASE_PATH")
                .unwrap_or_else(|| "./data/recordings.db".to_string())
                .into(),
            recordings_path: get("RECORDINGS_PATH")
                .unwrap_or_else(|| "./recordings".to_string())
                .into(),
            temp_audio_dir: get("TEMP_AUDIO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("voice-scribe")),
            web_host: get("WEB_SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            web_port,
            public_base_url,
            audio_format,
            audio_quality: get("AUDIO_QUALITY").unwrap_or_else(|| "192k".to_string()),
            sample_rate: 48000,
            channels: 2,
            tool_timeout: Duration::from_secs(parse_or(&get, "TOOL_TIMEOUT_SECS", 60)?),
            max_recording_duration: (max_recording_secs > 0)
                .then(|| Duration::from_secs(max_recording_secs)),
            download_ttl: Duration::from_secs(parse_or(&get, "DOWNLOAD_TTL_SECS", 3600)?),
            single_use_downloads: parse_or(&get, "SINGLE_USE_DOWNLOADS", false)?,
            token_cleanup_interval: Duration::from_secs(
                parse_or(&get, "TOKEN_CLEANUP_INTERVAL_SECS", 3600)?.max(1),
            ),
            shutdown_timeout: Duration::from_secs(parse_or(&get, "SHUTDOWN_TIMEOUT_SECS", 30)?),
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_path: get("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
        })
    }

    /// Address the download server binds to
    pub fn web_bind_addr(&self) -> String {
        format!("{}:{}", self.web_host, self.web_port)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        None => Ok(default),
    }
}
