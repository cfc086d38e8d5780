//! Live speech options for one session, and the snapshot constructors that
//! freeze them into tasks.

use crate::client::EngineClient;
use crate::directive::ParameterChange;
use crate::error::VoiceError;
use crate::protocol::SpeechArgs;
use crate::registry::VoiceRegistry;
use crate::task::{BreakTask, SpeechTask};
use crate::voice::{normalize_language, LoadedVoice, Voice, FALLBACK_SPEAKER_NAME};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_RATE: u8 = 50;
pub const DEFAULT_VOLUME: u8 = 100;
pub const DEFAULT_PITCH: u8 = 50;

/// Active synthesis configuration. Cloning takes a snapshot.
#[derive(Debug, Clone)]
pub struct SpeechOptions {
    pub voice: Arc<Voice>,
    pub info: Arc<LoadedVoice>,
    pub rate: Option<u8>,
    pub volume: Option<u8>,
    pub pitch: Option<u8>,
    pub sentence_silence_ms: Option<u32>,
}

impl SpeechOptions {
    pub fn new(voice: Arc<Voice>, info: Arc<LoadedVoice>) -> Self {
        Self {
            voice,
            info,
            rate: None,
            volume: None,
            pitch: None,
            sentence_silence_ms: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Unset values are left out so the engine applies its own defaults.
    pub fn speech_args(&self) -> SpeechArgs {
        SpeechArgs {
            rate: self.rate,
            volume: self.volume,
            pitch: self.pitch,
            appended_silence_ms: self.sentence_silence_ms,
        }
    }
}

pub struct Synthesizer {
    registry: Arc<VoiceRegistry>,
    client: EngineClient,
    options: SpeechOptions,
    /// Preferred voice key per normalized language.
    language_voices: BTreeMap<String, String>,
}

impl Synthesizer {
    /// Loads `voice` into the engine and makes it current.
    pub async fn new(
        registry: Arc<VoiceRegistry>,
        client: EngineClient,
        voice: Arc<Voice>,
    ) -> Result<Self, VoiceError> {
        let info = voice.load(&client).await?;
        Ok(Self {
            registry,
            client,
            options: SpeechOptions::new(voice, info),
            language_voices: BTreeMap::new(),
        })
    }

    pub fn with_language_voices(mut self, map: &BTreeMap<String, String>) -> Self {
        self.language_voices = map
            .iter()
            .map(|(lang, key)| (normalize_language(lang), key.clone()))
            .collect();
        self
    }

    pub fn registry(&self) -> &Arc<VoiceRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    pub fn options(&self) -> &SpeechOptions {
        &self.options
    }

    pub fn voice(&self) -> &Arc<Voice> {
        &self.options.voice
    }

    async fn use_voice(&mut self, voice: Arc<Voice>) -> Result<(), VoiceError> {
        let info = voice.load(&self.client).await?;
        tracing::debug!(key = voice.key(), "voice selected");
        self.options.voice = voice;
        self.options.info = info;
        Ok(())
    }

    pub async fn set_voice(&mut self, key: &str) -> Result<(), VoiceError> {
        let voice = self
            .registry
            .get(key)
            .cloned()
            .ok_or_else(|| VoiceError::NotFound(key.to_string()))?;
        self.use_voice(voice).await
    }

    pub fn language(&self) -> &str {
        self.options.voice.language()
    }

    /// Switch to a voice for `lang`. Keeps the current voice if it already speaks it.
    pub async fn set_language(&mut self, lang: &str) -> Result<(), VoiceError> {
        let lang = normalize_language(lang);
        if self.language() == lang {
            return Ok(());
        }
        let preferred = self
            .language_voices
            .get(&lang)
            .and_then(|key| self.registry.get(key))
            .cloned();
        let voice = preferred
            .or_else(|| self.registry.resolve_language(&lang).cloned())
            .ok_or_else(|| VoiceError::LanguageNotFound(lang.clone()))?;
        self.use_voice(voice).await
    }

    /// Single-speaker voices report the fallback name.
    pub async fn speaker(&self) -> Result<String, VoiceError> {
        Ok(self.options.voice.speaker(&self.client).await?)
    }

    pub fn speakers(&self) -> Vec<String> {
        if self.options.info.is_multi_speaker() {
            self.options.info.speaker_names()
        } else {
            vec![FALLBACK_SPEAKER_NAME.to_string()]
        }
    }

    pub async fn set_speaker(&self, name: &str) -> Result<(), VoiceError> {
        let info = &self.options.info;
        if !info.is_multi_speaker() {
            return Ok(());
        }
        let speaker = if name == FALLBACK_SPEAKER_NAME {
            info.speaker_names()
                .into_iter()
                .next()
                .ok_or_else(|| VoiceError::SpeakerNotFound(name.to_string()))?
        } else if info.speakers.contains_key(name) {
            name.to_string()
        } else {
            return Err(VoiceError::SpeakerNotFound(name.to_string()));
        };
        self.options.voice.set_speaker(&self.client, &speaker).await?;
        Ok(())
    }

    pub fn rate(&self) -> u8 {
        self.options.rate.unwrap_or(DEFAULT_RATE)
    }

    pub fn set_rate(&mut self, rate: u8) {
        self.options.rate = Some(rate.min(100));
    }

    pub fn volume(&self) -> u8 {
        self.options.volume.unwrap_or(DEFAULT_VOLUME)
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.options.volume = Some(volume.min(100));
    }

    pub fn pitch(&self) -> u8 {
        self.options.pitch.unwrap_or(DEFAULT_PITCH)
    }

    pub fn set_pitch(&mut self, pitch: u8) {
        self.options.pitch = Some(pitch.min(100));
    }

    pub fn set_sentence_silence(&mut self, ms: Option<u32>) {
        self.options.sentence_silence_ms = ms;
    }

    /// Apply a parameter directive. `Language(None)` returns to `default_language`.
    pub async fn apply(&mut self, change: &ParameterChange, default_language: &str) -> Result<(), VoiceError> {
        match change {
            ParameterChange::Language(Some(lang)) => self.set_language(lang).await?,
            ParameterChange::Language(None) => self.set_language(default_language).await?,
            ParameterChange::Rate(v) => self.set_rate(*v),
            ParameterChange::Volume(v) => self.set_volume(*v),
            ParameterChange::Pitch(v) => self.set_pitch(*v),
        }
        Ok(())
    }

    pub fn speech_task(&self, text: impl Into<String>) -> SpeechTask {
        SpeechTask {
            text: text.into(),
            options: self.options.clone(),
        }
    }

    pub fn break_task(&self, duration_ms: u32) -> BreakTask {
        BreakTask {
            duration_ms,
            sample_rate: self.options.sample_rate(),
        }
    }
}
