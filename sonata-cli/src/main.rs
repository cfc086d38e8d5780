//! Sonata CLI: speak text with inline commands, list installed voices, check the engine.

mod markup;
mod wav;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sonata_core::{
    DriverConfig, EngineSession, SinkFactory, SonataDriver, SpeechEvent, VoiceRegistry,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use wav::WavCapture;

const DEFAULT_CONFIG: &str = "sonata.toml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file; defaults to ./sonata.toml when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Speak text; supports [[pause N]], [[index N]], [[rate N]], [[volume N]], [[pitch N]], [[lang X]]
    Speak(SpeakArgs),
    /// List installed voices
    Voices,
    /// Start the engine and report its version
    Check,
}

#[derive(Args, Debug)]
struct SpeakArgs {
    /// Text to speak (joined with spaces)
    #[arg(required_unless_present = "file")]
    text: Vec<String>,

    /// Read the text from a file instead
    #[arg(short, long, conflicts_with = "text")]
    file: Option<PathBuf>,

    /// Write WAV instead of playing on the default device
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Voice key or key prefix
    #[arg(long)]
    voice: Option<String>,

    /// standard or fast
    #[arg(long)]
    variant: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    rate: Option<u8>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pitch: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Speak(args) => speak(config, args).await,
        Command::Voices => list_voices(&config),
        Command::Check => check(config).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
    match path {
        Some(p) => DriverConfig::load_path(p),
        None if Path::new(DEFAULT_CONFIG).is_file() => DriverConfig::load_path(Path::new(DEFAULT_CONFIG)),
        None => Ok(DriverConfig::default()),
    }
}

#[cfg(feature = "playback")]
fn device_sinks() -> Result<Arc<dyn SinkFactory>> {
    Ok(Arc::new(sonata_core::RodioOutput::open_default()?))
}

#[cfg(not(feature = "playback"))]
fn device_sinks() -> Result<Arc<dyn SinkFactory>> {
    bail!("built without the `playback` feature; pass --output FILE.wav")
}

async fn speak(mut config: DriverConfig, args: SpeakArgs) -> Result<()> {
    let text = match &args.file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        None => args.text.join(" "),
    };
    let directives = markup::parse(&text)?;
    if args.voice.is_some() {
        config.speech.voice = args.voice.clone();
    }

    let capture = args.output.as_ref().map(|_| WavCapture::new());
    let sinks: Arc<dyn SinkFactory> = match &capture {
        Some(c) => Arc::new(c.clone()),
        None => device_sinks()?,
    };

    let driver = SonataDriver::initialize(config, sinks).await?;
    let result = run_speech(&driver, &args, directives).await;
    driver.terminate().await;
    result?;

    if let (Some(capture), Some(path)) = (capture, &args.output) {
        for file in capture.write(path)? {
            eprintln!("wrote {}", file.display());
        }
    }
    Ok(())
}

async fn run_speech(
    driver: &SonataDriver,
    args: &SpeakArgs,
    directives: Vec<sonata_core::Directive>,
) -> Result<()> {
    if let Some(variant) = &args.variant {
        driver.set_variant(variant).await?;
    }
    if let Some(rate) = args.rate {
        driver.set_rate(rate).await;
    }
    if let Some(volume) = args.volume {
        driver.set_volume(volume).await;
    }
    if let Some(pitch) = args.pitch {
        driver.set_pitch(pitch).await;
    }
    tracing::info!(voice = %driver.voice().await, "speaking");

    let mut events = driver.subscribe();
    driver.speak(directives).await?;
    loop {
        let event = tokio::select! {
            ev = events.recv() => ev,
            _ = tokio::signal::ctrl_c() => {
                driver.cancel().await;
                eprintln!("cancelled");
                return Ok(());
            }
        };
        match event {
            Ok(SpeechEvent::IndexReached(i)) => println!("index {i}"),
            Ok(SpeechEvent::DoneSpeaking) => {
                println!("done");
                return Ok(());
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "speech events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => bail!("driver stopped before speech finished"),
        }
    }
}

fn list_voices(config: &DriverConfig) -> Result<()> {
    let root = config.voices.root();
    let registry = VoiceRegistry::load_from_directory(&root)?;
    if registry.is_empty() {
        eprintln!("No voices installed in {}", root.display());
        return Ok(());
    }
    let mut voices: BTreeMap<String, (String, Vec<&str>)> = BTreeMap::new();
    for voice in registry.voices() {
        let entry = voices
            .entry(voice.standard_variant_key())
            .or_insert_with(|| (voice.display_name(), Vec::new()));
        entry.1.push(voice.variant().as_str());
    }
    for (id, (name, mut variants)) in voices {
        variants.sort_unstable();
        println!("{id}\t{name}\t{}", variants.join(","));
    }
    Ok(())
}

async fn check(config: DriverConfig) -> Result<()> {
    let session = EngineSession::new(config.engine);
    let result = session.init().await;
    session.shutdown().await;
    let version = result?;
    println!("engine {version}");
    Ok(())
}
