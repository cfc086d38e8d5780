//! Integration tests: run the CLI binary against an in-process engine.

use sonata_core::testing::{pcm_chunk, FakeEngine};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

fn sonata_cli_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sonata-cli"))
}

fn add_voice(base: &Path, key: &str) {
    let dir = base.join("voices").join("v1.0").join(key);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{key}.onnx")), b"model").unwrap();
    fs::write(dir.join(format!("{key}.onnx.json")), b"{}").unwrap();
}

fn write_config(base: &Path, port: Option<u16>) -> PathBuf {
    let engine = match port {
        Some(port) => format!("attach_port = {port}\nconnect_timeout_secs = 5\n"),
        None => "executable = \"bin/missing-engine\"\nconnect_timeout_secs = 1\n".to_string(),
    };
    let path = base.join("sonata.toml");
    fs::write(&path, format!("[engine]\n{engine}\n[voices]\ndir = \"voices\"\n")).unwrap();
    path
}

async fn run(base: &Path, args: &[&str]) -> Output {
    Command::new(sonata_cli_bin())
        .args(args)
        .current_dir(base)
        .output()
        .await
        .unwrap()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[tokio::test]
async fn voices_lists_installed_voices_with_variants() {
    let dir = tempfile::tempdir().unwrap();
    add_voice(dir.path(), "en_US-amy-medium");
    add_voice(dir.path(), "en_US-amy-medium+RT");
    add_voice(dir.path(), "de_DE-thorsten-low");
    fs::create_dir_all(dir.path().join("voices/v1.0/not-a-voice")).unwrap();
    write_config(dir.path(), None);

    let out = run(dir.path(), &["voices"]).await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "de_DE-thorsten-low\tthorsten (de-DE) - low\tstandard",
            "en_US-amy-medium\tamy (en-US) - medium\tfast,standard",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn speak_writes_wav_and_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    add_voice(dir.path(), "en_US-amy-medium");
    let engine = FakeEngine::default();
    let port = engine.listen().await.unwrap();
    write_config(dir.path(), Some(port));

    let out = run(
        dir.path(),
        &["speak", "--output", "out.wav", "--rate", "100", "Hello [[index 1]]world"],
    )
    .await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["index 1", "done"]);

    let mut reader = hound::WavReader::open(dir.path().join("out.wav")).unwrap();
    assert_eq!(reader.spec().sample_rate, 22050);
    let bytes: Vec<u8> = reader
        .samples::<i16>()
        .flat_map(|s| s.unwrap().to_le_bytes())
        .collect();
    let expected = [pcm_chunk("Hello world", 0), pcm_chunk("Hello world", 1)].concat();
    assert_eq!(bytes, expected);

    let utterances = engine.utterances();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].text, "Hello world");
    // 100% without rate boost is engine rate 40.
    assert_eq!(utterances[0].speech_args.as_ref().and_then(|a| a.rate), Some(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_reports_engine_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let port = engine.listen().await.unwrap();
    let config = write_config(dir.path(), Some(port));

    let out = run(dir.path(), &["--config", config.to_str().unwrap(), "check"]).await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(String::from_utf8(out.stdout).unwrap().trim(), "engine 1.0.0-fake");
}

#[tokio::test]
async fn check_fails_when_engine_cannot_start() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), None);
    let out = run(dir.path(), &["check"]).await;
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unavailable"), "stderr: {}", stderr(&out));
}

#[tokio::test]
async fn speak_rejects_bad_markup_before_starting_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), None);
    let out = run(dir.path(), &["speak", "-o", "x.wav", "[[rate 300]]"]).await;
    assert!(!out.status.success());
    assert!(stderr(&out).contains("0..=100"), "stderr: {}", stderr(&out));
    assert!(!dir.path().join("x.wav").exists());
}
