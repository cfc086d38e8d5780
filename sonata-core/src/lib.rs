//! Sonata core: engine supervision and RPC client, voice registry, directive
//! compiler, plan scheduler and pooled audio output.

pub mod client;
pub mod compiler;
pub mod config;
pub mod directive;
pub mod driver;
pub mod error;
pub mod player;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod synth;
pub mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validate;
pub mod voice;
pub mod workers;

pub use client::{EngineClient, SpeechStream};
pub use compiler::compile;
pub use config::{DriverConfig, EngineConfig, SpeechConfig, VoiceSettings, VoicesConfig};
pub use directive::{Directive, ParameterChange};
pub use driver::{ScaleKind, SonataDriver, VoiceDescription};
pub use error::{DriverError, EngineError, PlayerError, TaskError, VoiceError};
pub use player::{AudioSink, PlayerPool, SinkFactory, MAX_QUEUED_BUFFERS};
#[cfg(feature = "playback")]
pub use player::RodioOutput;
pub use protocol::{SpeechArgs, SynthesisOptions, PROTOCOL_VERSION};
pub use registry::VoiceRegistry;
pub use scheduler::{PlanState, Scheduler, SpeechEvent};
pub use session::EngineSession;
pub use supervisor::EngineSupervisor;
pub use synth::{SpeechOptions, Synthesizer};
pub use task::{BreakTask, Plan, SpeechTask, Task};
pub use validate::validate_voice_dir;
pub use voice::{LoadedVoice, Variant, Voice};
pub use workers::WorkerPool;
