use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_QUALITY: u32 = 85;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FPS: u32 = 25;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Output encoding requested from the encoder component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Jpeg,
    Png,
    Bmp,
    Gif,
}

impl Encoding {
    pub fn extension(self) -> &'static str {
        match self {
            Encoding::Jpeg => "jpg",
            Encoding::Png => "png",
            Encoding::Bmp => "bmp",
            Encoding::Gif => "gif",
        }
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Encoding::Jpeg),
            "png" => Ok(Encoding::Png),
            "bmp" => Ok(Encoding::Bmp),
            "gif" => Ok(Encoding::Gif),
            other => Err(anyhow!("unknown encoding {:?}", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    encoding: Option<Encoding>,
    quality: Option<u32>,
    delay_ms: Option<u64>,
    capture_timeout_ms: Option<u64>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    enabled: Option<bool>,
    fps: Option<u32>,
    poll_interval_ms: Option<u64>,
}

/// Camera pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    /// Encoder quality factor, 1..=100.
    pub quality: Option<u32>,
    /// Sensor settling time before each capture is triggered.
    pub delay: Option<Duration>,
    /// Still-capture deadline, and the staleness window in video mode.
    /// `None` waits forever.
    pub capture_timeout: Option<Duration>,
    /// Build the streaming pipeline instead of the one-shot still pipeline.
    pub video_mode: bool,
    pub fps: u32,
    /// How often `capture_video` checks for a new frame.
    pub poll_interval: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            encoding: Encoding::default(),
            quality: Some(DEFAULT_QUALITY),
            delay: None,
            capture_timeout: Some(Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS)),
            video_mode: false,
            fps: DEFAULT_FPS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl CameraConfig {
    /// Defaults, overlaid by the file named in `PICAM_CONFIG`, then `PICAM_*` env vars.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, ignoring `PICAM_CONFIG` but still applying env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CameraConfigFile) -> Self {
        let defaults = Self::default();
        let video = file.video.unwrap_or_default();
        Self {
            width: file.width.unwrap_or(defaults.width),
            height: file.height.unwrap_or(defaults.height),
            encoding: file.encoding.unwrap_or(defaults.encoding),
            quality: file.quality.or(defaults.quality),
            delay: file.delay_ms.map(Duration::from_millis),
            capture_timeout: match file.capture_timeout_ms {
                Some(ms) => timeout_from_millis(ms),
                None => defaults.capture_timeout,
            },
            video_mode: video.enabled.unwrap_or(defaults.video_mode),
            fps: video.fps.unwrap_or(defaults.fps),
            poll_interval: video
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(width) = env_parse::<u32>("PICAM_WIDTH")? {
            self.width = width;
        }
        if let Some(height) = env_parse::<u32>("PICAM_HEIGHT")? {
            self.height = height;
        }
        if let Some(encoding) = env_parse::<Encoding>("PICAM_ENCODING")? {
            self.encoding = encoding;
        }
        if let Some(quality) = env_parse::<u32>("PICAM_QUALITY")? {
            self.quality = Some(quality);
        }
        if let Some(delay) = env_parse::<u64>("PICAM_DELAY_MS")? {
            self.delay = Some(Duration::from_millis(delay));
        }
        if let Some(timeout) = env_parse::<u64>("PICAM_CAPTURE_TIMEOUT_MS")? {
            self.capture_timeout = timeout_from_millis(timeout);
        }
        if let Some(video_mode) = env_parse::<bool>("PICAM_VIDEO_MODE")? {
            self.video_mode = video_mode;
        }
        if let Some(fps) = env_parse::<u32>("PICAM_FPS")? {
            self.fps = fps;
        }
        if let Some(interval) = env_parse::<u64>("PICAM_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(interval);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "picture dimensions must be non-zero (got {}x{})",
                self.width,
                self.height
            ));
        }
        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("quality must be between 1 and 100 (got {})", quality));
            }
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Zero means no deadline.
fn timeout_from_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{} has an invalid value {:?}: {}", key, value, e)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<CameraConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
