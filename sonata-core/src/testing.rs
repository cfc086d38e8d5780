//! In-process stand-ins for the engine and the audio device, used by tests.

use crate::client::EngineClient;
use crate::error::PlayerError;
use crate::player::{AudioSink, SinkFactory};
use crate::protocol::{
    read_frame, write_frame, write_message, AudioInfo, Call, Reply, Request, Response,
    SynthesisOptions, Utterance, VoiceInfo,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;

/// Utterances containing this text get an `error` reply instead of audio.
pub const FAIL_MARKER: &str = "<fail>";

/// Deterministic PCM for chunk `index` of `text`: the text itself, padded to whole samples.
pub fn pcm_chunk(text: &str, index: usize) -> Vec<u8> {
    let mut b = format!("[{text}#{index}]").into_bytes();
    if b.len() % 2 == 1 {
        b.push(b' ');
    }
    b
}

#[derive(Debug, Clone)]
pub struct FakeEngineConfig {
    pub version: String,
    pub sample_rate: u32,
    /// `(config path fragment, sample rate)` overrides.
    pub voice_rates: Vec<(String, u32)>,
    pub speakers: BTreeMap<String, i64>,
    pub streaming: bool,
    pub chunks_per_utterance: usize,
    pub chunk_delay: Duration,
}

impl Default for FakeEngineConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0-fake".to_string(),
            sample_rate: 22050,
            voice_rates: Vec::new(),
            speakers: BTreeMap::new(),
            streaming: true,
            chunks_per_utterance: 2,
            chunk_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    options: HashMap<String, SynthesisOptions>,
    cancelled: HashSet<u64>,
}

/// Speaks the wire protocol; voice ids are the config paths it was asked to load.
#[derive(Clone, Default)]
pub struct FakeEngine {
    config: Arc<FakeEngineConfig>,
    state: Arc<Mutex<FakeState>>,
}

type SharedWriter<S> = Arc<tokio::sync::Mutex<WriteHalf<S>>>;

impl FakeEngine {
    pub fn new(config: FakeEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::default(),
        }
    }

    /// Client connected through an in-memory pipe.
    pub fn client(&self) -> EngineClient {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        tokio::spawn(self.clone().serve(theirs));
        let (reader, writer) = tokio::io::split(ours);
        EngineClient::from_io(reader, writer)
    }

    /// Accept TCP connections on a loopback port.
    pub async fn listen(&self) -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let engine = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(engine.clone().serve(stream));
            }
        });
        Ok(port)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn utterances(&self) -> Vec<Utterance> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SynthesizeUtterance { utterance, .. } => Some(utterance),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.name() == method).count()
    }

    pub fn options(&self, voice_id: &str) -> Option<SynthesisOptions> {
        self.state.lock().options.get(voice_id).cloned()
    }

    async fn serve<S>(self, io: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(io);
        let writer: SharedWriter<S> = Arc::new(tokio::sync::Mutex::new(writer));
        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            let Ok(request) = serde_json::from_slice::<Request>(&frame) else {
                break;
            };
            self.state.lock().calls.push(request.call.clone());
            match request.call {
                Call::Cancel { target } => {
                    self.state.lock().cancelled.insert(target);
                }
                Call::SynthesizeUtterance { utterance, .. } => {
                    tokio::spawn(self.clone().stream_audio(request.id, utterance, Arc::clone(&writer)));
                }
                call => {
                    let reply = self.reply(call);
                    let mut w = writer.lock().await;
                    if write_message(&mut *w, &Response { id: request.id, reply }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn stream_audio<S>(self, id: u64, utterance: Utterance, writer: SharedWriter<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if utterance.text.contains(FAIL_MARKER) {
            let reply = Reply::Error {
                message: "synthesis failed".to_string(),
            };
            let _ = write_message(&mut *writer.lock().await, &Response { id, reply }).await;
            return;
        }
        for i in 0..self.config.chunks_per_utterance {
            if !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            if self.state.lock().cancelled.contains(&id) {
                return;
            }
            let mut w = writer.lock().await;
            let header = Response { id, reply: Reply::Audio };
            if write_message(&mut *w, &header).await.is_err()
                || write_frame(&mut *w, &pcm_chunk(&utterance.text, i)).await.is_err()
            {
                return;
            }
        }
        let _ = write_message(&mut *writer.lock().await, &Response { id, reply: Reply::End }).await;
    }

    fn reply(&self, call: Call) -> Reply {
        let mut state = self.state.lock();
        match call {
            Call::GetVersion => Reply::Version {
                version: self.config.version.clone(),
            },
            Call::LoadVoice { config_path } => {
                let sample_rate = self
                    .config
                    .voice_rates
                    .iter()
                    .find(|(fragment, _)| config_path.contains(fragment.as_str()))
                    .map_or(self.config.sample_rate, |(_, rate)| *rate);
                let first_speaker = self
                    .config
                    .speakers
                    .iter()
                    .min_by_key(|(_, idx)| **idx)
                    .map(|(name, _)| name.clone());
                let defaults = SynthesisOptions {
                    speaker: first_speaker,
                    length_scale: Some(1.0),
                    noise_scale: Some(0.667),
                    noise_w: Some(0.8),
                };
                let options = state
                    .options
                    .entry(config_path.clone())
                    .or_insert(defaults)
                    .clone();
                Reply::VoiceInfo(VoiceInfo {
                    voice_id: config_path,
                    synth_options: options,
                    audio: AudioInfo {
                        sample_rate,
                        num_channels: 1,
                        sample_width: 2,
                    },
                    speakers: self.config.speakers.clone(),
                    supports_streaming_output: self.config.streaming,
                })
            }
            Call::GetSynthesisOptions { voice_id } => match state.options.get(&voice_id) {
                Some(o) => Reply::SynthesisOptions(o.clone()),
                None => Reply::Error {
                    message: format!("unknown voice {voice_id}"),
                },
            },
            Call::SetSynthesisOptions { voice_id, options } => match state.options.get_mut(&voice_id) {
                Some(current) => {
                    if options.speaker.is_some() {
                        current.speaker = options.speaker;
                    }
                    if options.length_scale.is_some() {
                        current.length_scale = options.length_scale;
                    }
                    if options.noise_scale.is_some() {
                        current.noise_scale = options.noise_scale;
                    }
                    if options.noise_w.is_some() {
                        current.noise_w = options.noise_w;
                    }
                    Reply::Ack
                }
                None => Reply::Error {
                    message: format!("unknown voice {voice_id}"),
                },
            },
            other => Reply::Error {
                message: format!("unsupported call {}", other.name()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Opened(u32),
    Appended(u32, Vec<u8>),
    Cleared(u32),
    Paused(u32, bool),
    Volume(u32, f32),
    Closed(u32),
}

#[derive(Default)]
struct Recording {
    events: Vec<SinkEvent>,
    held: bool,
    queued: HashMap<u32, usize>,
}

/// Sink factory that records everything written. Audio "plays" instantly
/// unless held.
#[derive(Clone, Default)]
pub struct RecordingSinks {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingSinks {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.inner.lock().events.clone()
    }

    pub fn opened(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Opened(rate) => Some(rate),
                _ => None,
            })
            .collect()
    }

    /// Everything appended at `sample_rate`, in order.
    pub fn audio(&self, sample_rate: u32) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Appended(rate, pcm) if rate == sample_rate => Some(pcm),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Appended audio at `sample_rate` as text (see [`pcm_chunk`]).
    pub fn transcript(&self, sample_rate: u32) -> String {
        String::from_utf8_lossy(&self.audio(sample_rate)).into_owned()
    }

    /// While held, appended buffers stay queued; releasing plays them all.
    pub fn hold(&self, held: bool) {
        let mut r = self.inner.lock();
        r.held = held;
        if !held {
            r.queued.clear();
        }
    }

    pub fn queued(&self, sample_rate: u32) -> usize {
        self.inner.lock().queued.get(&sample_rate).copied().unwrap_or(0)
    }

    fn record(&self, event: SinkEvent) {
        self.inner.lock().events.push(event);
    }
}

impl SinkFactory for RecordingSinks {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>, PlayerError> {
        self.record(SinkEvent::Opened(sample_rate));
        Ok(Box::new(RecordingSink {
            sample_rate,
            sinks: self.clone(),
        }))
    }
}

struct RecordingSink {
    sample_rate: u32,
    sinks: RecordingSinks,
}

impl AudioSink for RecordingSink {
    fn append(&mut self, pcm: &[u8]) -> Result<(), PlayerError> {
        let mut r = self.sinks.inner.lock();
        r.events.push(SinkEvent::Appended(self.sample_rate, pcm.to_vec()));
        if r.held {
            *r.queued.entry(self.sample_rate).or_default() += 1;
        }
        Ok(())
    }

    fn queued(&self) -> usize {
        self.sinks.queued(self.sample_rate)
    }

    fn clear(&mut self) {
        let mut r = self.sinks.inner.lock();
        r.queued.remove(&self.sample_rate);
        r.events.push(SinkEvent::Cleared(self.sample_rate));
    }

    fn set_paused(&mut self, paused: bool) {
        self.sinks.record(SinkEvent::Paused(self.sample_rate, paused));
    }

    fn set_volume(&mut self, volume: f32) {
        self.sinks.record(SinkEvent::Volume(self.sample_rate, volume));
    }

    fn close(&mut self) {
        self.sinks.record(SinkEvent::Closed(self.sample_rate));
    }
}
