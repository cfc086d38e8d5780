//! Speech directives accepted by the driver. Hosts map their own command types
//! onto this closed set.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Directive {
    Text(String),
    /// Progress marker reported once the audio before it has played.
    Index(i32),
    Break {
        ms: u32,
    },
    /// `None` returns to the language active when the sequence began.
    Language(Option<String>),
    Rate(u8),
    Volume(u8),
    Pitch(u8),
}

/// A directive that changes the live speech options instead of producing audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterChange {
    Language(Option<String>),
    Rate(u8),
    Volume(u8),
    Pitch(u8),
}

impl Directive {
    pub fn text(s: impl Into<String>) -> Self {
        Directive::Text(s.into())
    }

    pub fn parameter_change(&self) -> Option<ParameterChange> {
        match self {
            Directive::Language(lang) => Some(ParameterChange::Language(lang.clone())),
            Directive::Rate(v) => Some(ParameterChange::Rate((*v).min(100))),
            Directive::Volume(v) => Some(ParameterChange::Volume((*v).min(100))),
            Directive::Pitch(v) => Some(ParameterChange::Pitch((*v).min(100))),
            Directive::Text(_) | Directive::Index(_) | Directive::Break { .. } => None,
        }
    }
}
