//! Executable tasks and the plan that orders them.

use crate::synth::SpeechOptions;

/// Characters that carry no speech on their own.
pub const IGNORED_PUNCTUATION: &[char] = &[',', '(', ')', '{', '}', '[', ']', '`', '"', '\''];

/// Text with its own snapshot of the speech options.
#[derive(Debug, Clone)]
pub struct SpeechTask {
    pub text: String,
    pub options: SpeechOptions,
}

impl SpeechTask {
    pub fn is_ignorable(&self) -> bool {
        is_ignorable_text(&self.text)
    }
}

/// Short strings of bare punctuation (or whitespace) are not worth a synthesis request.
pub fn is_ignorable_text(text: &str) -> bool {
    text.chars().count() < 10 && text.trim().chars().all(|c| IGNORED_PUNCTUATION.contains(&c))
}

/// Longest stretch of silence handed to a player as one buffer.
pub const SILENCE_CHUNK_MS: u32 = 100;

/// Silence at the sample rate of the voice active when the break was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakTask {
    pub duration_ms: u32,
    pub sample_rate: u32,
}

impl BreakTask {
    pub fn frames(&self) -> u64 {
        u64::from(self.duration_ms) * u64::from(self.sample_rate) / 1000
    }

    /// Frames in one full chunk; never zero.
    pub fn chunk_frames(&self) -> u64 {
        (u64::from(SILENCE_CHUNK_MS) * u64::from(self.sample_rate) / 1000).max(1)
    }

    /// Byte lengths of the 16-bit mono chunks that make up the break. Every
    /// chunk but the last is [`Self::chunk_frames`] long.
    pub fn chunk_lens(&self) -> impl Iterator<Item = usize> {
        let total = self.frames();
        let step = self.chunk_frames();
        (0..total.div_ceil(step)).map(move |i| ((total - i * step).min(step) * 2) as usize)
    }
}

#[derive(Debug, Clone)]
pub enum Task {
    Speech(SpeechTask),
    Break(BreakTask),
    IndexMarker(Vec<i32>),
    Done,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Speech(_) => "speech",
            Task::Break(_) => "break",
            Task::IndexMarker(_) => "index",
            Task::Done => "done",
        }
    }
}

/// Ordered tasks ending in exactly one [`Task::Done`].
#[derive(Debug, Clone)]
pub struct Plan {
    tasks: Vec<Task>,
}

impl Plan {
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|t| !matches!(t, Task::Done))
            .collect();
        tasks.push(Task::Done);
        Self { tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Marker values in the order they will be reported.
    pub fn markers(&self) -> Vec<i32> {
        self.tasks
            .iter()
            .filter_map(|t| match t {
                Task::IndexMarker(m) => Some(m.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl IntoIterator for Plan {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}
