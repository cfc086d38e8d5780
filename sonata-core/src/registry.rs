//! Voice discovery: one directory per voice under the versioned voices root.

use crate::error::VoiceError;
use crate::voice::{normalize_language, primary_language, variant_keys, Voice};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Installed voices, ordered by key.
#[derive(Debug, Default)]
pub struct VoiceRegistry {
    voices: Vec<Arc<Voice>>,
    by_key: BTreeMap<String, Arc<Voice>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_directory(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| anyhow::anyhow!("create voices dir {:?}: {}", root, e))?;
        let mut reg = VoiceRegistry::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match Voice::from_path(&path) {
                Ok(voice) => reg.insert(voice),
                Err(VoiceError::InvalidName(name)) => {
                    tracing::debug!(%name, "skipping directory with non-voice name");
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping voice"),
            }
        }
        tracing::info!(count = reg.len(), root = %root.display(), "voices loaded");
        Ok(reg)
    }

    fn insert(&mut self, voice: Voice) {
        let voice = Arc::new(voice);
        self.by_key.insert(voice.key().to_string(), Arc::clone(&voice));
        self.voices = self.by_key.values().cloned().collect();
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Voice>> {
        self.by_key.get(key)
    }

    pub fn voices(&self) -> &[Arc<Voice>] {
        &self.voices
    }

    /// Distinct normalized languages, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.voices.iter().map(|v| v.language().to_string()).collect();
        langs.sort();
        langs.dedup();
        langs
    }

    /// First voice (by key) whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&Arc<Voice>> {
        self.voices.iter().find(|v| v.key().starts_with(prefix))
    }

    /// Voice for a language: exact normalized match first, then any voice
    /// sharing the primary subtag (`en_GB` falls back to `en_US`).
    pub fn resolve_language(&self, lang: &str) -> Option<&Arc<Voice>> {
        let lang = normalize_language(lang);
        self.voices
            .iter()
            .find(|v| v.language() == lang)
            .or_else(|| {
                let primary = primary_language(&lang);
                self.voices
                    .iter()
                    .find(|v| primary_language(v.language()) == primary)
            })
    }

    /// Standard and fast variants of `key`, where installed.
    pub fn variants(&self, key: &str) -> (Option<&Arc<Voice>>, Option<&Arc<Voice>>) {
        let (standard, fast) = variant_keys(key);
        (self.get(&standard), self.get(&fast))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn add_voice(root: &Path, key: &str) -> PathBuf {
        let dir = root.join(key);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("model.onnx"), b"m").unwrap();
        fs::write(dir.join("model.onnx.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn load_skips_bad_names_and_incomplete_voices() {
        let root = tempfile::tempdir().unwrap();
        add_voice(root.path(), "en_US-ryan-high");
        add_voice(root.path(), "de_DE-thorsten-medium");
        add_voice(root.path(), "en_US-ryan-high+RT");
        add_voice(root.path(), "not a voice");
        let broken = root.path().join("fr_FR-siwis-low");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("model.onnx"), b"m").unwrap();
        fs::write(root.path().join("stray.txt"), b"x").unwrap();

        let reg = VoiceRegistry::load_from_directory(root.path()).unwrap();
        let keys: Vec<_> = reg.voices().iter().map(|v| v.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["de_DE-thorsten-medium", "en_US-ryan-high", "en_US-ryan-high+RT"]
        );
        assert_eq!(reg.languages(), vec!["de_DE".to_string(), "en_US".to_string()]);
        assert!(reg.get("fr_FR-siwis-low").is_none());
    }

    #[test]
    fn load_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("voices").join("v1.0");
        let reg = VoiceRegistry::load_from_directory(&root).unwrap();
        assert!(reg.is_empty());
        assert!(root.is_dir());
    }

    #[test]
    fn resolve_language_falls_back_to_primary_subtag() {
        let root = tempfile::tempdir().unwrap();
        add_voice(root.path(), "en_US-amy-medium");
        add_voice(root.path(), "pt_BR-faber-medium");
        let reg = VoiceRegistry::load_from_directory(root.path()).unwrap();
        assert_eq!(reg.resolve_language("en-us").unwrap().key(), "en_US-amy-medium");
        assert_eq!(reg.resolve_language("en_GB").unwrap().key(), "en_US-amy-medium");
        assert_eq!(reg.resolve_language("pt").unwrap().key(), "pt_BR-faber-medium");
        assert!(reg.resolve_language("ja").is_none());
    }

    #[test]
    fn prefix_and_variant_lookup() {
        let root = tempfile::tempdir().unwrap();
        add_voice(root.path(), "en_US-amy-medium");
        add_voice(root.path(), "en_US-amy-medium+RT");
        add_voice(root.path(), "en_US-lessac-high");
        let reg = VoiceRegistry::load_from_directory(root.path()).unwrap();
        assert_eq!(reg.find_by_prefix("en_US-l").unwrap().key(), "en_US-lessac-high");
        assert!(reg.find_by_prefix("xx").is_none());

        let (std_v, fast_v) = reg.variants("en_US-amy-medium+RT");
        assert_eq!(std_v.unwrap().key(), "en_US-amy-medium");
        assert_eq!(fast_v.unwrap().key(), "en_US-amy-medium+RT");
        let (std_v, fast_v) = reg.variants("en_US-lessac-high");
        assert!(std_v.is_some());
        assert!(fast_v.is_none());
    }
}
