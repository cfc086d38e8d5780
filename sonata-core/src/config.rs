//! Driver configuration file (TOML): engine launch, voice storage, speech defaults,
//! and remembered per-voice settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full driver config (sonata.toml).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub voices: VoicesConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    /// Remembered settings keyed by variant-independent voice id.
    #[serde(default)]
    pub voice_settings: BTreeMap<String, VoiceSettings>,
    /// Preferred voice key per language, consulted on language switches.
    #[serde(default)]
    pub language_voices: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Phonemizer data directory handed to the engine.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Number of rotated engine logs kept next to the current one.
    #[serde(default = "default_log_keep")]
    pub log_keep: usize,
    /// Use an engine that is already listening on this port instead of launching one.
    #[serde(default)]
    pub attach_port: Option<u16>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_executable() -> PathBuf {
    PathBuf::from("bin").join(if cfg!(windows) { "sonata-grpc.exe" } else { "sonata-grpc" })
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("espeak-ng-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_keep() -> usize {
    3
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_keep: default_log_keep(),
            attach_port: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoicesConfig {
    #[serde(default = "default_voices_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_voices_version")]
    pub version: String,
}

fn default_voices_dir() -> PathBuf {
    PathBuf::from("voices")
}

fn default_voices_version() -> String {
    "v1.0".to_string()
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            dir: default_voices_dir(),
            version: default_voices_version(),
        }
    }
}

impl VoicesConfig {
    /// Versioned root holding one directory per installed voice.
    pub fn root(&self) -> PathBuf {
        self.dir.join(&self.version)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SpeechConfig {
    /// Key (or key prefix) of the voice selected at startup.
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub rate_boost: bool,
    /// Size of the blocking worker pool; defaults to half the cores, at least 2.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Silence the engine appends after each sentence; engine default when unset.
    #[serde(default)]
    pub sentence_silence_ms: Option<u32>,
}

/// Per-voice settings. Scale factors are percentages where 50 is the voice default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct VoiceSettings {
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub noise_scale: Option<u8>,
    #[serde(default)]
    pub length_scale: Option<u8>,
    #[serde(default)]
    pub noise_w: Option<u8>,
}

impl DriverConfig {
    /// Load from TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let c: DriverConfig = toml::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    /// Load from file path; relative paths inside are resolved against the file's directory.
    pub fn load_path(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {:?}: {}", path, e))?;
        let mut c = Self::from_toml(&s)?;
        if let Some(base) = path.parent() {
            c.resolve_relative_to(base);
        }
        Ok(c)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        for p in [
            &mut self.engine.executable,
            &mut self.engine.data_dir,
            &mut self.engine.log_dir,
            &mut self.voices.dir,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (voice, s) in &self.voice_settings {
            for (name, v) in [
                ("noise_scale", s.noise_scale),
                ("length_scale", s.length_scale),
                ("noise_w", s.noise_w),
            ] {
                if let Some(v) = v {
                    anyhow::ensure!(v <= 100, "{voice}.{name} = {v} is outside 0..=100");
                }
            }
        }
        Ok(())
    }
}
