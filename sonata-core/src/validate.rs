//! Voice directory validation: a voice needs a model and a JSON config sidecar.

use crate::error::VoiceError;
use std::path::{Path, PathBuf};

pub const MODEL_EXTENSION: &str = "onnx";
pub const CONFIG_EXTENSION: &str = "json";
pub const MODEL_CARD_FILE: &str = "MODEL_CARD";

/// Files making up one installed voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceFiles {
    pub model: PathBuf,
    pub config: PathBuf,
    pub model_card: Option<PathBuf>,
}

fn has_extension(p: &Path, ext: &str) -> bool {
    p.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Locate the model, config and optional model card inside `dir`.
/// Picks the lexicographically first match so the result is stable.
pub fn validate_voice_dir(key: &str, dir: &Path) -> Result<VoiceFiles, VoiceError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|_| VoiceError::MissingFiles {
            key: key.to_string(),
            missing: "model",
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let model = files
        .iter()
        .find(|p| has_extension(p, MODEL_EXTENSION))
        .cloned()
        .ok_or_else(|| VoiceError::MissingFiles {
            key: key.to_string(),
            missing: "model",
        })?;
    let config = files
        .iter()
        .find(|p| has_extension(p, CONFIG_EXTENSION))
        .cloned()
        .ok_or_else(|| VoiceError::MissingFiles {
            key: key.to_string(),
            missing: "config",
        })?;
    let model_card = Some(dir.join(MODEL_CARD_FILE)).filter(|p| p.is_file());
    Ok(VoiceFiles {
        model,
        config,
        model_card,
    })
}
