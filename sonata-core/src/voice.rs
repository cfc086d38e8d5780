//! Voice types: on-disk identity parsed from the directory name, and the remote
//! state assigned by the engine once the model is loaded.

use crate::client::{EngineClient, SpeechStream};
use crate::error::{EngineError, VoiceError};
use crate::protocol::{SpeechArgs, SynthesisOptions};
use crate::validate::{validate_voice_dir, VoiceFiles};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Suffix marking the fast (real-time) variant of a voice.
pub const FAST_VARIANT_SUFFIX: &str = "+RT";
/// Speaker name reported for single-speaker voices.
pub const FALLBACK_SPEAKER_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Standard,
    Fast,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Fast => "fast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(Variant::Standard),
            "fast" => Some(Variant::Fast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scales {
    pub length_scale: f32,
    pub noise_scale: f32,
    pub noise_w: f32,
}

/// What the engine told us when the voice was loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedVoice {
    pub remote_id: String,
    pub sample_rate: u32,
    pub default_scales: Scales,
    /// Speaker name -> index, empty for single-speaker voices.
    pub speakers: BTreeMap<String, i64>,
    pub default_speaker: Option<String>,
    pub supports_streaming_output: bool,
}

impl LoadedVoice {
    pub fn is_multi_speaker(&self) -> bool {
        !self.speakers.is_empty()
    }

    /// Speaker names ordered by speaker index.
    pub fn speaker_names(&self) -> Vec<String> {
        let mut v: Vec<_> = self.speakers.iter().collect();
        v.sort_by_key(|(name, idx)| (**idx, (*name).clone()));
        v.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Parsed `<language>-<name>-<quality>[+RT]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceKey {
    pub language: String,
    pub name: String,
    pub quality: String,
    pub fast: bool,
}

impl VoiceKey {
    pub fn parse(key: &str) -> Result<Self, VoiceError> {
        let (base, fast) = match key.strip_suffix(FAST_VARIANT_SUFFIX) {
            Some(base) => (base, true),
            None => (key, false),
        };
        let parts: Vec<&str> = base.split('-').collect();
        let [lang, name, quality] = parts.as_slice() else {
            return Err(VoiceError::InvalidName(key.to_string()));
        };
        if lang.is_empty() || name.is_empty() || quality.is_empty() {
            return Err(VoiceError::InvalidName(key.to_string()));
        }
        Ok(Self {
            language: normalize_language(lang),
            name: name.to_string(),
            quality: quality.to_ascii_lowercase(),
            fast,
        })
    }
}

/// `en-us` / `EN_us` -> `en_US`.
pub fn normalize_language(lang: &str) -> String {
    let mut parts = lang.split(['-', '_']);
    let primary = parts.next().unwrap_or_default().to_ascii_lowercase();
    match parts.next() {
        Some(region) if !region.is_empty() => format!("{primary}_{}", region.to_ascii_uppercase()),
        _ => primary,
    }
}

/// Primary language subtag of a normalized language (`en_US` -> `en`).
pub fn primary_language(lang: &str) -> &str {
    lang.split('_').next().unwrap_or(lang)
}

/// `(standard_key, fast_key)` for any variant of a voice.
pub fn variant_keys(key: &str) -> (String, String) {
    let standard = key.replace(FAST_VARIANT_SUFFIX, "");
    let fast = format!("{standard}{FAST_VARIANT_SUFFIX}");
    (standard, fast)
}

/// An installed voice. `load` assigns the remote identity once.
#[derive(Debug)]
pub struct Voice {
    key: String,
    parsed: VoiceKey,
    location: PathBuf,
    files: VoiceFiles,
    loaded: OnceCell<Arc<LoadedVoice>>,
}

impl Voice {
    /// Build from a voice directory. Fails on a name that does not follow the
    /// voice naming pattern, or on missing model/config files.
    pub fn from_path(path: &Path) -> Result<Self, VoiceError> {
        let key = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VoiceError::InvalidName(path.display().to_string()))?
            .to_string();
        let parsed = VoiceKey::parse(&key)?;
        let files = validate_voice_dir(&key, path)?;
        Ok(Self {
            key,
            parsed,
            location: path.to_path_buf(),
            files,
            loaded: OnceCell::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.parsed.name
    }

    pub fn language(&self) -> &str {
        &self.parsed.language
    }

    pub fn quality(&self) -> &str {
        &self.parsed.quality
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn files(&self) -> &VoiceFiles {
        &self.files
    }

    pub fn is_fast(&self) -> bool {
        self.key.contains(FAST_VARIANT_SUFFIX)
    }

    pub fn variant(&self) -> Variant {
        if self.is_fast() {
            Variant::Fast
        } else {
            Variant::Standard
        }
    }

    pub fn standard_variant_key(&self) -> String {
        variant_keys(&self.key).0
    }

    pub fn fast_variant_key(&self) -> String {
        variant_keys(&self.key).1
    }

    /// `"<name> (<lang>) - <quality>"`, e.g. `amy (en-US) - medium`.
    pub fn display_name(&self) -> String {
        format!(
            "{} ({}) - {}",
            self.name(),
            self.language().replace('_', "-"),
            self.quality()
        )
    }

    /// Free-text model card shipped next to the model, if any.
    pub fn model_card(&self) -> Option<String> {
        let path = self.files.model_card.as_ref()?;
        std::fs::read_to_string(path).ok()
    }

    pub fn loaded(&self) -> Option<&Arc<LoadedVoice>> {
        self.loaded.get()
    }

    /// Load the model into the engine on first use; later calls are free.
    pub async fn load(&self, client: &EngineClient) -> Result<Arc<LoadedVoice>, EngineError> {
        let loaded = self
            .loaded
            .get_or_try_init(|| async {
                let config_path = self.files.config.to_string_lossy().into_owned();
                let info = client.load_voice(&config_path).await?;
                tracing::info!(
                    key = %self.key,
                    remote_id = %info.voice_id,
                    sample_rate = info.audio.sample_rate,
                    streaming = info.supports_streaming_output,
                    "voice loaded"
                );
                let defaults = &info.synth_options;
                let default_speaker = if info.speakers.is_empty() {
                    None
                } else {
                    defaults.speaker.clone()
                };
                Ok::<_, EngineError>(Arc::new(LoadedVoice {
                    remote_id: info.voice_id,
                    sample_rate: info.audio.sample_rate,
                    default_scales: Scales {
                        length_scale: defaults.length_scale.unwrap_or(1.0),
                        noise_scale: defaults.noise_scale.unwrap_or(0.667),
                        noise_w: defaults.noise_w.unwrap_or(0.8),
                    },
                    speakers: info.speakers,
                    default_speaker,
                    supports_streaming_output: info.supports_streaming_output,
                }))
            })
            .await?;
        Ok(Arc::clone(loaded))
    }

    async fn remote(&self, client: &EngineClient) -> Result<Arc<LoadedVoice>, EngineError> {
        self.load(client).await
    }

    pub async fn synthesis_options(&self, client: &EngineClient) -> Result<SynthesisOptions, EngineError> {
        let remote = self.remote(client).await?;
        client.get_synthesis_options(&remote.remote_id).await
    }

    async fn update(&self, client: &EngineClient, options: SynthesisOptions) -> Result<(), EngineError> {
        let remote = self.remote(client).await?;
        client.set_synthesis_options(&remote.remote_id, options).await
    }

    /// Current engine-side speaker, or the fallback name for single-speaker voices.
    pub async fn speaker(&self, client: &EngineClient) -> Result<String, EngineError> {
        let remote = self.remote(client).await?;
        if !remote.is_multi_speaker() {
            return Ok(FALLBACK_SPEAKER_NAME.to_string());
        }
        let options = client.get_synthesis_options(&remote.remote_id).await?;
        Ok(options
            .speaker
            .or_else(|| remote.default_speaker.clone())
            .unwrap_or_else(|| FALLBACK_SPEAKER_NAME.to_string()))
    }

    /// Ignored for single-speaker voices.
    pub async fn set_speaker(&self, client: &EngineClient, speaker: &str) -> Result<(), EngineError> {
        if !self.remote(client).await?.is_multi_speaker() {
            return Ok(());
        }
        self.update(
            client,
            SynthesisOptions {
                speaker: Some(speaker.to_string()),
                ..SynthesisOptions::default()
            },
        )
        .await
    }

    pub async fn set_length_scale(&self, client: &EngineClient, value: f32) -> Result<(), EngineError> {
        self.update(
            client,
            SynthesisOptions {
                length_scale: Some(value),
                ..SynthesisOptions::default()
            },
        )
        .await
    }

    pub async fn set_noise_scale(&self, client: &EngineClient, value: f32) -> Result<(), EngineError> {
        self.update(
            client,
            SynthesisOptions {
                noise_scale: Some(value),
                ..SynthesisOptions::default()
            },
        )
        .await
    }

    pub async fn set_noise_w(&self, client: &EngineClient, value: f32) -> Result<(), EngineError> {
        self.update(
            client,
            SynthesisOptions {
                noise_w: Some(value),
                ..SynthesisOptions::default()
            },
        )
        .await
    }

    /// Request audio for `text`, streamed incrementally when the voice supports it.
    pub async fn synthesize(
        &self,
        client: &EngineClient,
        text: &str,
        args: SpeechArgs,
    ) -> Result<SpeechStream, EngineError> {
        let remote = self.remote(client).await?;
        client.synthesize(&remote.remote_id, text, args, remote.supports_streaming_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_voice_dir(root: &Path, key: &str) -> PathBuf {
        let dir = root.join(key);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{key}.onnx")), b"model").unwrap();
        fs::write(dir.join(format!("{key}.onnx.json")), b"{}").unwrap();
        dir
    }

    #[test]
    fn parse_standard_key() {
        let k = VoiceKey::parse("en_US-amy-Medium").unwrap();
        assert_eq!(k.language, "en_US");
        assert_eq!(k.name, "amy");
        assert_eq!(k.quality, "medium");
        assert!(!k.fast);
    }

    #[test]
    fn parse_fast_key() {
        let k = VoiceKey::parse("de_DE-thorsten-high+RT").unwrap();
        assert_eq!(k.language, "de_DE");
        assert_eq!(k.quality, "high");
        assert!(k.fast);
    }

    #[test]
    fn parse_rejects_bad_names() {
        for bad in ["readme", "en_US-amy", "a-b-c-d", "en--low", ".cache"] {
            assert!(VoiceKey::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn normalize_language_forms() {
        assert_eq!(normalize_language("en-us"), "en_US");
        assert_eq!(normalize_language("EN_gb"), "en_GB");
        assert_eq!(normalize_language("ar"), "ar");
        assert_eq!(primary_language("pt_BR"), "pt");
    }

    #[test]
    fn variant_keys_pair() {
        assert_eq!(
            variant_keys("en_US-amy-medium"),
            ("en_US-amy-medium".to_string(), "en_US-amy-medium+RT".to_string())
        );
        assert_eq!(
            variant_keys("en_US-amy-medium+RT"),
            ("en_US-amy-medium".to_string(), "en_US-amy-medium+RT".to_string())
        );
        assert_eq!(Variant::parse("FAST"), Some(Variant::Fast));
        assert_eq!(Variant::parse("turbo"), None);
    }

    #[test]
    fn from_path_reads_identity_and_model_card() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_voice_dir(root.path(), "en_GB-alan-low+RT");
        fs::write(dir.join("MODEL_CARD"), "Alan, low quality").unwrap();
        let v = Voice::from_path(&dir).unwrap();
        assert_eq!(v.key(), "en_GB-alan-low+RT");
        assert_eq!(v.variant(), Variant::Fast);
        assert_eq!(v.standard_variant_key(), "en_GB-alan-low");
        assert_eq!(v.display_name(), "alan (en-GB) - low");
        assert_eq!(v.model_card().as_deref(), Some("Alan, low quality"));
        assert!(v.loaded().is_none());
    }

    #[test]
    fn speaker_names_follow_index_order() {
        let lv = LoadedVoice {
            remote_id: "r".into(),
            sample_rate: 22050,
            default_scales: Scales {
                length_scale: 1.0,
                noise_scale: 0.667,
                noise_w: 0.8,
            },
            speakers: BTreeMap::from([("zed".to_string(), 0), ("amy".to_string(), 1)]),
            default_speaker: Some("zed".into()),
            supports_streaming_output: false,
        };
        assert!(lv.is_multi_speaker());
        assert_eq!(lv.speaker_names(), vec!["zed".to_string(), "amy".to_string()]);
    }
}
