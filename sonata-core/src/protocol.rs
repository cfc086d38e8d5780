//! Engine wire protocol v0.1: frame format (4-byte length + payload), JSON messages.
//!
//! Every message is one JSON frame. An `audio` reply is followed immediately by
//! one raw frame holding little-endian 16-bit mono PCM.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: &str = "0.1";

/// Upper bound on a single frame; anything larger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    GetVersion,
    LoadVoice {
        config_path: String,
    },
    GetSynthesisOptions {
        voice_id: String,
    },
    SetSynthesisOptions {
        voice_id: String,
        options: SynthesisOptions,
    },
    SynthesizeUtterance {
        utterance: Utterance,
        /// Ask the engine for incremental chunks instead of one chunk per sentence.
        realtime: bool,
    },
    /// Abandon the streaming call with id `target`.
    Cancel {
        target: u64,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::GetVersion => "get_version",
            Call::LoadVoice { .. } => "load_voice",
            Call::GetSynthesisOptions { .. } => "get_synthesis_options",
            Call::SetSynthesisOptions { .. } => "set_synthesis_options",
            Call::SynthesizeUtterance { .. } => "synthesize_utterance",
            Call::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Version { version: String },
    VoiceInfo(VoiceInfo),
    SynthesisOptions(SynthesisOptions),
    Ack,
    /// Followed by one raw PCM frame.
    Audio,
    /// Terminates a streaming call.
    End,
    Error { message: String },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Version { .. } => "version",
            Reply::VoiceInfo(_) => "voice_info",
            Reply::SynthesisOptions(_) => "synthesis_options",
            Reply::Ack => "ack",
            Reply::Audio => "audio",
            Reply::End => "end",
            Reply::Error { .. } => "error",
        }
    }
}

/// Engine-side synthesis parameters. Every field is optional so the same type
/// serves as a partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_w: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub num_channels: u16,
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,
}

fn default_channels() -> u16 {
    1
}

fn default_sample_width() -> u16 {
    2
}

/// Reply to `load_voice`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub voice_id: String,
    pub synth_options: SynthesisOptions,
    pub audio: AudioInfo,
    /// Speaker name -> speaker index; empty for single-speaker voices.
    #[serde(default)]
    pub speakers: BTreeMap<String, i64>,
    #[serde(default)]
    pub supports_streaming_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appended_silence_ms: Option<u32>,
}

impl SpeechArgs {
    pub fn is_empty(&self) -> bool {
        self.rate.is_none()
            && self.volume.is_none()
            && self.pitch.is_none()
            && self.appended_silence_ms.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub voice_id: String,
    pub text: String,
    /// Omitted when no argument is set so the engine keeps its own defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_args: Option<SpeechArgs>,
}

impl Utterance {
    pub fn new(voice_id: impl Into<String>, text: impl Into<String>, args: SpeechArgs) -> Self {
        Self {
            voice_id: voice_id.into(),
            text: text.into(),
            speech_args: (!args.is_empty()).then_some(args),
        }
    }
}

/// Frame format: 4-byte length (little-endian) + payload. No per-frame content-type.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame: 4-byte length then payload. `None` on a clean end of stream.
pub async fn read_frame<R>(r: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize and write one JSON message frame.
pub async fn write_message<W, T>(w: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message)?;
    write_frame(w, &json).await
}
