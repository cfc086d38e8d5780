//! Directive sequence -> task plan.
//!
//! Adjacent text (including text split by index markers) becomes one speech
//! task. Markers are held back and emitted as one task right before the next
//! audio-producing task, or after the speech task of the text run they fell
//! into. Parameter directives close the current text run and change the live
//! options, so only tasks compiled after them see the change.

use crate::directive::Directive;
use crate::synth::Synthesizer;
use crate::task::{Plan, Task};

#[derive(Default)]
struct Builder {
    tasks: Vec<Task>,
    text: String,
    markers: Vec<i32>,
}

impl Builder {
    fn flush_markers(&mut self) {
        if !self.markers.is_empty() {
            self.tasks.push(Task::IndexMarker(std::mem::take(&mut self.markers)));
        }
    }

    fn close_text(&mut self, synth: &Synthesizer) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        self.tasks.push(Task::Speech(synth.speech_task(text)));
        self.flush_markers();
    }
}

pub async fn compile(directives: impl IntoIterator<Item = Directive>, synth: &mut Synthesizer) -> Plan {
    let default_language = synth.language().to_string();
    let mut b = Builder::default();
    for directive in directives {
        if let Some(change) = directive.parameter_change() {
            b.close_text(synth);
            if let Err(e) = synth.apply(&change, &default_language).await {
                tracing::warn!(?change, error = %e, "ignoring parameter change");
            }
            continue;
        }
        match directive {
            Directive::Text(s) => {
                if s.is_empty() {
                    continue;
                }
                if b.text.is_empty() {
                    b.flush_markers();
                }
                b.text.push_str(&s);
            }
            Directive::Index(i) => b.markers.push(i),
            Directive::Break { ms } => {
                b.close_text(synth);
                b.flush_markers();
                b.tasks.push(Task::Break(synth.break_task(ms)));
            }
            Directive::Language(_) | Directive::Rate(_) | Directive::Volume(_) | Directive::Pitch(_) => {}
        }
    }
    b.close_text(synth);
    b.flush_markers();
    let plan = Plan::new(b.tasks);
    tracing::debug!(tasks = plan.len(), "plan compiled");
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VoiceRegistry;
    use crate::testing::{FakeEngine, FakeEngineConfig};
    use std::path::Path;
    use std::sync::Arc;

    fn add_voice(root: &Path, key: &str) {
        let dir = root.join(key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.onnx"), b"m").unwrap();
        std::fs::write(dir.join("model.onnx.json"), b"{}").unwrap();
    }

    async fn synth(root: &Path) -> Synthesizer {
        add_voice(root, "en_US-amy-medium");
        add_voice(root, "de_DE-thorsten-low");
        let engine = FakeEngine::new(FakeEngineConfig {
            voice_rates: vec![("thorsten".into(), 16000)],
            ..FakeEngineConfig::default()
        });
        let registry = Arc::new(VoiceRegistry::load_from_directory(root).unwrap());
        let voice = Arc::clone(registry.get("en_US-amy-medium").unwrap());
        Synthesizer::new(registry, engine.client(), voice).await.unwrap()
    }

    fn shape(plan: &Plan) -> Vec<String> {
        plan.tasks()
            .iter()
            .map(|t| match t {
                Task::Speech(s) => format!("speech:{}", s.text),
                Task::Break(b) => format!("break:{}@{}", b.duration_ms, b.sample_rate),
                Task::IndexMarker(m) => format!("index:{m:?}"),
                Task::Done => "done".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_and_parameter_only_input_is_just_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = synth(dir.path()).await;
        assert_eq!(shape(&compile([], &mut s).await), vec!["done"]);
        let plan = compile([Directive::Rate(10), Directive::Pitch(70)], &mut s).await;
        assert_eq!(shape(&plan), vec!["done"]);
        assert_eq!(s.rate(), 10);
        assert_eq!(s.pitch(), 70);
    }

    #[tokio::test]
    async fn text_and_index_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = synth(dir.path()).await;
        let plan = compile(
            [
                Directive::text("Hello "),
                Directive::Index(1),
                Directive::text("world"),
                Directive::Index(2),
            ],
            &mut s,
        )
        .await;
        assert_eq!(shape(&plan), vec!["speech:Hello world", "index:[1, 2]", "done"]);
    }

    #[tokio::test]
    async fn leading_markers_precede_their_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = synth(dir.path()).await;
        let plan = compile(
            [
                Directive::Index(1),
                Directive::text("a"),
                Directive::Index(2),
                Directive::Break { ms: 100 },
                Directive::Index(3),
                Directive::text("b"),
            ],
            &mut s,
        )
        .await;
        assert_eq!(
            shape(&plan),
            vec![
                "index:[1]",
                "speech:a",
                "index:[2]",
                "break:100@22050",
                "index:[3]",
                "speech:b",
                "done"
            ]
        );
    }

    #[tokio::test]
    async fn rate_change_only_affects_later_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = synth(dir.path()).await;
        let plan = compile(
            [Directive::text("slow"), Directive::Rate(80), Directive::text("fast")],
            &mut s,
        )
        .await;
        let Task::Speech(first) = &plan.tasks()[0] else {
            panic!("expected speech")
        };
        let Task::Speech(second) = &plan.tasks()[1] else {
            panic!("expected speech")
        };
        assert_eq!(first.options.rate, None);
        assert_eq!(second.options.rate, Some(80));
        // Sticky for the next plan.
        let plan = compile([Directive::text("again")], &mut s).await;
        let Task::Speech(third) = &plan.tasks()[0] else {
            panic!("expected speech")
        };
        assert_eq!(third.options.rate, Some(80));
    }

    #[tokio::test]
    async fn language_switch_and_return_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = synth(dir.path()).await;
        let plan = compile(
            [
                Directive::Language(Some("de".into())),
                Directive::Break { ms: 10 },
                Directive::text("hallo"),
                Directive::Language(None),
                Directive::text("hello"),
                Directive::Language(Some("ja".into())),
            ],
            &mut s,
        )
        .await;
        assert_eq!(
            shape(&plan),
            vec!["break:10@16000", "speech:hallo", "speech:hello", "done"]
        );
        let Task::Speech(hallo) = &plan.tasks()[1] else {
            panic!("expected speech")
        };
        assert_eq!(hallo.options.voice.key(), "de_DE-thorsten-low");
        assert_eq!(s.voice().key(), "en_US-amy-medium");
    }
}
