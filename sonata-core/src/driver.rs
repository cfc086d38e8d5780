//! Host-facing driver: owns the engine session, the voice registry, the live
//! synthesizer, the player pool and the scheduler, and exposes speech commands
//! plus voice settings.

use crate::compiler::compile;
use crate::config::{DriverConfig, VoiceSettings};
use crate::directive::Directive;
use crate::error::{DriverError, VoiceError};
use crate::player::{PlayerPool, SinkFactory};
use crate::registry::VoiceRegistry;
use crate::scheduler::{PlanState, Scheduler, SpeechEvent};
use crate::session::EngineSession;
use crate::synth::Synthesizer;
use crate::voice::{variant_keys, Variant};
use crate::workers::{default_worker_count, WorkerPool};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Engine rate used for 100% when rate boost is off.
const UNBOOSTED_MAX_RATE: u8 = 40;
const DEFAULT_FACTOR: u8 = 50;

/// Scale 0..=100 onto `min..=max`.
pub fn percent_to_param(percent: u8, min: f32, max: f32) -> f32 {
    f32::from(percent) / 100.0 * (max - min) + min
}

fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

/// Engine value for a scale factor: 50 keeps the voice default, anything
/// else spans `0..=default * multiplier`, never below 0.1.
pub fn scale_from_factor(factor: u8, default: f32, multiplier: f32) -> f32 {
    if factor == DEFAULT_FACTOR {
        default
    } else {
        round2(percent_to_param(factor, 0.0, default * multiplier)).max(0.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    Noise,
    Length,
    NoiseW,
}

impl ScaleKind {
    fn multiplier(self) -> f32 {
        match self {
            ScaleKind::Noise | ScaleKind::NoiseW => 3.0,
            ScaleKind::Length => 2.0,
        }
    }
}

/// A selectable voice, independent of its variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceDescription {
    pub id: String,
    pub display_name: String,
    pub language: String,
}

#[derive(Debug, Default)]
struct ScaleFactors {
    noise_scale: Option<u8>,
    length_scale: Option<u8>,
    noise_w: Option<u8>,
}

impl ScaleFactors {
    fn slot(&mut self, kind: ScaleKind) -> &mut Option<u8> {
        match kind {
            ScaleKind::Noise => &mut self.noise_scale,
            ScaleKind::Length => &mut self.length_scale,
            ScaleKind::NoiseW => &mut self.noise_w,
        }
    }
}

fn remembered_factor(settings: &VoiceSettings, kind: ScaleKind) -> Option<u8> {
    match kind {
        ScaleKind::Noise => settings.noise_scale,
        ScaleKind::Length => settings.length_scale,
        ScaleKind::NoiseW => settings.noise_w,
    }
}

struct Settings {
    rate_boost: bool,
    /// Keyed by variant-independent voice id.
    remembered: BTreeMap<String, VoiceSettings>,
    /// Factors of the current voice; `None` until first read or written.
    factors: ScaleFactors,
}

pub struct SonataDriver {
    session: EngineSession,
    registry: Arc<VoiceRegistry>,
    synth: tokio::sync::Mutex<Synthesizer>,
    players: Arc<PlayerPool>,
    workers: WorkerPool,
    scheduler: Scheduler,
    settings: Mutex<Settings>,
    terminated: AtomicBool,
}

impl SonataDriver {
    /// Start the engine, discover voices and select the configured voice.
    pub async fn initialize(config: DriverConfig, sinks: Arc<dyn SinkFactory>) -> Result<Self, DriverError> {
        let session = EngineSession::new(config.engine.clone());
        if let Err(e) = session.init().await {
            session.shutdown().await;
            return Err(e);
        }
        match Self::build(&config, session, sinks).await {
            Ok(driver) => Ok(driver),
            Err((e, session)) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    async fn build(
        config: &DriverConfig,
        session: EngineSession,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self, (DriverError, EngineSession)> {
        let root = config.voices.root();
        let registry = match VoiceRegistry::load_from_directory(&root) {
            Ok(r) if !r.is_empty() => Arc::new(r),
            Ok(_) => {
                let e = DriverError::Unavailable(format!("no voices installed in {}", root.display()));
                return Err((e, session));
            }
            Err(e) => return Err((DriverError::Unavailable(e.to_string()), session)),
        };
        let client = match session.client() {
            Ok(c) => c,
            Err(e) => return Err((e, session)),
        };
        let initial = config
            .speech
            .voice
            .as_deref()
            .and_then(|prefix| registry.find_by_prefix(prefix))
            .or_else(|| registry.voices().first())
            .cloned();
        let Some(initial) = initial else {
            return Err((DriverError::Unavailable("no voices installed".into()), session));
        };
        let synth = match Synthesizer::new(Arc::clone(&registry), client.clone(), Arc::clone(&initial)).await {
            Ok(s) => {
                let mut s = s.with_language_voices(&config.language_voices);
                s.set_sentence_silence(config.speech.sentence_silence_ms);
                s
            }
            Err(e) => return Err((e.into(), session)),
        };

        let players = Arc::new(PlayerPool::new(sinks));
        let workers = WorkerPool::new(config.speech.workers.unwrap_or_else(default_worker_count));
        let (events, _) = broadcast::channel(256);
        let scheduler = Scheduler::new(client, Arc::clone(&players), workers.clone(), events);
        let driver = Self {
            session,
            registry,
            synth: tokio::sync::Mutex::new(synth),
            players,
            workers,
            scheduler,
            settings: Mutex::new(Settings {
                rate_boost: config.speech.rate_boost,
                remembered: config.voice_settings.clone(),
                factors: ScaleFactors::default(),
            }),
            terminated: AtomicBool::new(false),
        };
        let id = initial.standard_variant_key();
        if let Err(e) = driver.set_voice(&id).await {
            tracing::warn!(voice = %id, error = %e, "could not apply remembered voice settings");
        }
        tracing::info!(voice = %id, voices = driver.registry.len(), "driver ready");
        Ok(driver)
    }

    fn ensure_live(&self) -> Result<(), DriverError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable("driver terminated".into()));
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<VoiceRegistry> {
        &self.registry
    }

    pub fn engine_version(&self) -> Option<String> {
        self.session.availability()?.ok().map(str::to_string)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.scheduler.subscribe()
    }

    /// Replace whatever is being spoken with `directives`.
    pub async fn speak(&self, directives: impl IntoIterator<Item = Directive>) -> Result<(), DriverError> {
        self.ensure_live()?;
        self.scheduler.cancel().await;
        let plan = {
            let mut synth = self.synth.lock().await;
            compile(directives, &mut synth).await
        };
        self.scheduler.start(plan).await;
        Ok(())
    }

    pub async fn cancel(&self) {
        self.scheduler.cancel().await;
    }

    pub fn pause(&self, paused: bool) {
        self.players.pause_all(paused);
    }

    /// Wait for the current plan to finish or be cancelled.
    pub async fn wait(&self) -> PlanState {
        self.scheduler.wait().await
    }

    /// Cancel speech, close the players and stop the engine. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.cancel().await;
        let players = Arc::clone(&self.players);
        if let Err(e) = self.workers.run(move || players.close_all()).await {
            tracing::warn!(error = %e, "failed to close audio players");
        }
        self.session.shutdown().await;
        tracing::info!("driver terminated");
    }

    pub fn available_voices(&self) -> Vec<VoiceDescription> {
        let mut seen = BTreeMap::new();
        for voice in self.registry.voices() {
            let id = voice.standard_variant_key();
            seen.entry(id.clone()).or_insert_with(|| VoiceDescription {
                id,
                display_name: voice.display_name(),
                language: voice.language().to_string(),
            });
        }
        seen.into_values().collect()
    }

    /// Variant-independent id of the current voice.
    pub async fn voice(&self) -> String {
        self.synth.lock().await.voice().standard_variant_key()
    }

    /// Select a voice by id; unknown ids fall back to the first voice.
    /// Reapplies the remembered variant, scale factors and speaker.
    pub async fn set_voice(&self, id: &str) -> Result<(), DriverError> {
        let voices = self.available_voices();
        let id = match voices.iter().find(|v| v.id == id) {
            Some(v) => v.id.clone(),
            None => match voices.first() {
                Some(v) => {
                    tracing::debug!(requested = %id, fallback = %v.id, "unknown voice");
                    v.id.clone()
                }
                None => return Err(VoiceError::NotFound(id.to_string()).into()),
            },
        };
        let key = match self.registry.variants(&id) {
            (Some(v), _) | (None, Some(v)) => v.key().to_string(),
            (None, None) => return Err(VoiceError::NotFound(id).into()),
        };
        let (variant, speaker) = {
            let mut settings = self.settings.lock();
            settings.factors = ScaleFactors::default();
            let remembered = settings.remembered.get(&id);
            (
                remembered.and_then(|r| r.variant.clone()),
                remembered.and_then(|r| r.speaker.clone()),
            )
        };
        let variant = {
            let mut synth = self.synth.lock().await;
            synth.set_voice(&key).await?;
            variant.unwrap_or_else(|| synth.voice().variant().as_str().to_string())
        };
        self.set_variant(&variant).await?;
        for kind in [ScaleKind::Noise, ScaleKind::Length, ScaleKind::NoiseW] {
            let factor = self.scale_factor(kind).await;
            self.apply_scale(kind, factor).await?;
        }
        if let Some(speaker) = speaker {
            if let Err(e) = self.set_speaker(&speaker).await {
                tracing::warn!(%speaker, error = %e, "remembered speaker not applied");
            }
        }
        Ok(())
    }

    pub async fn variant(&self) -> Variant {
        self.synth.lock().await.voice().variant()
    }

    /// Switch between the standard and fast model of the current voice.
    /// Unknown names and missing variants are ignored.
    pub async fn set_variant(&self, name: &str) -> Result<(), DriverError> {
        let Some(variant) = Variant::parse(name) else {
            tracing::info!(variant = %name, "unknown voice variant");
            return Ok(());
        };
        let mut synth = self.synth.lock().await;
        let (standard, fast) = variant_keys(synth.voice().key());
        let key = match variant {
            Variant::Standard => standard.clone(),
            Variant::Fast => fast,
        };
        if self.registry.get(&key).is_none() {
            return Ok(());
        }
        synth.set_voice(&key).await?;
        self.settings
            .lock()
            .remembered
            .entry(standard)
            .or_default()
            .variant = Some(variant.as_str().to_string());
        Ok(())
    }

    pub async fn available_variants(&self) -> Vec<Variant> {
        let id = self.voice().await;
        match self.registry.variants(&id) {
            (Some(_), Some(_)) => vec![Variant::Standard, Variant::Fast],
            (Some(_), None) => vec![Variant::Standard],
            (None, Some(_)) => vec![Variant::Fast],
            (None, None) => Vec::new(),
        }
    }

    pub async fn speaker(&self) -> Result<String, DriverError> {
        Ok(self.synth.lock().await.speaker().await?)
    }

    /// Unknown speakers are rejected and the current speaker is remembered instead.
    pub async fn set_speaker(&self, name: &str) -> Result<(), DriverError> {
        let synth = self.synth.lock().await;
        let id = synth.voice().standard_variant_key();
        let remembered = match synth.set_speaker(name).await {
            Ok(()) => name.to_string(),
            Err(VoiceError::SpeakerNotFound(missing)) => {
                let current = synth.speaker().await?;
                self.settings.lock().remembered.entry(id).or_default().speaker = Some(current);
                return Err(VoiceError::SpeakerNotFound(missing).into());
            }
            Err(e) => return Err(e.into()),
        };
        self.settings.lock().remembered.entry(id).or_default().speaker = Some(remembered);
        Ok(())
    }

    pub async fn available_speakers(&self) -> Vec<String> {
        self.synth.lock().await.speakers()
    }

    pub fn rate_boost(&self) -> bool {
        self.settings.lock().rate_boost
    }

    pub async fn set_rate_boost(&self, enable: bool) {
        if enable == self.rate_boost() {
            return;
        }
        let rate = self.rate().await;
        self.settings.lock().rate_boost = enable;
        self.set_rate(rate).await;
    }

    /// 0..=100. Without boost the engine rate is capped at 40 and reported scaled up.
    pub async fn rate(&self) -> u8 {
        let boost = self.rate_boost();
        let mut synth = self.synth.lock().await;
        if boost {
            return synth.rate();
        }
        let capped = synth.rate().min(UNBOOSTED_MAX_RATE);
        synth.set_rate(capped);
        (f32::from(capped) * 2.5) as u8
    }

    pub async fn set_rate(&self, value: u8) {
        let boost = self.rate_boost();
        let value = value.min(100);
        let engine_rate = if boost {
            value
        } else {
            percent_to_param(value, 0.0, f32::from(UNBOOSTED_MAX_RATE)).round() as u8
        };
        self.synth.lock().await.set_rate(engine_rate);
    }

    pub async fn volume(&self) -> u8 {
        self.synth.lock().await.volume()
    }

    /// Sets the engine volume and the output volume.
    pub async fn set_volume(&self, value: u8) {
        let value = value.min(100);
        self.synth.lock().await.set_volume(value);
        self.players.set_volume(f32::from(value) / 100.0);
    }

    pub async fn pitch(&self) -> u8 {
        self.synth.lock().await.pitch()
    }

    /// Silence appended after each sentence; `None` leaves it to the engine.
    pub async fn set_sentence_silence(&self, ms: Option<u32>) {
        self.synth.lock().await.set_sentence_silence(ms);
    }

    pub async fn set_pitch(&self, value: u8) {
        self.synth.lock().await.set_pitch(value);
    }

    pub async fn language(&self) -> String {
        self.synth.lock().await.language().to_string()
    }

    pub async fn set_language(&self, lang: &str) -> Result<(), DriverError> {
        Ok(self.synth.lock().await.set_language(lang).await?)
    }

    /// Current factor (0..=100, 50 = voice default) for `kind`.
    pub async fn scale_factor(&self, kind: ScaleKind) -> u8 {
        let id = self.voice().await;
        let mut settings = self.settings.lock();
        if let Some(f) = *settings.factors.slot(kind) {
            return f;
        }
        let f = settings
            .remembered
            .get(&id)
            .and_then(|r| remembered_factor(r, kind))
            .unwrap_or(DEFAULT_FACTOR);
        *settings.factors.slot(kind) = Some(f);
        f
    }

    pub async fn set_scale_factor(&self, kind: ScaleKind, value: u8) -> Result<(), DriverError> {
        let value = value.min(100);
        if kind == ScaleKind::NoiseW {
            let cached = *self.settings.lock().factors.slot(kind);
            if cached == Some(value) {
                return Ok(());
            }
        }
        self.apply_scale(kind, value).await?;
        let id = self.voice().await;
        let mut settings = self.settings.lock();
        let remembered = settings.remembered.entry(id).or_default();
        match kind {
            ScaleKind::Noise => remembered.noise_scale = Some(value),
            ScaleKind::Length => remembered.length_scale = Some(value),
            ScaleKind::NoiseW => remembered.noise_w = Some(value),
        }
        Ok(())
    }

    async fn apply_scale(&self, kind: ScaleKind, factor: u8) -> Result<(), DriverError> {
        let synth = self.synth.lock().await;
        let defaults = synth.options().info.default_scales;
        let voice = Arc::clone(synth.voice());
        let client = synth.client();
        match kind {
            ScaleKind::Noise => {
                let v = scale_from_factor(factor, defaults.noise_scale, kind.multiplier());
                voice.set_noise_scale(client, v).await?;
            }
            ScaleKind::Length => {
                let v = scale_from_factor(factor, defaults.length_scale, kind.multiplier());
                voice.set_length_scale(client, v).await?;
            }
            ScaleKind::NoiseW => {
                let v = scale_from_factor(factor, defaults.noise_w, kind.multiplier());
                voice.set_noise_w(client, v).await?;
            }
        }
        *self.settings.lock().factors.slot(kind) = Some(factor);
        Ok(())
    }

    /// Remembered per-voice settings, as they would be written back to the config.
    pub fn remembered_settings(&self) -> BTreeMap<String, VoiceSettings> {
        self.settings.lock().remembered.clone()
    }
}
