//! Sink factory that captures PCM in memory and writes it out as WAV files.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use sonata_core::{AudioSink, PlayerError, SinkFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct Capture {
    /// Sample rates in the order they were first opened.
    rates: Vec<u32>,
    samples: Vec<(u32, Vec<i16>)>,
}

/// "Plays" instantly; everything appended ends up in the output file.
#[derive(Clone, Default)]
pub struct WavCapture {
    inner: Arc<Mutex<Capture>>,
}

impl WavCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one file per sample rate. A single rate goes to `path`; with
    /// several, each gets `<stem>-<rate>.wav` next to it. Returns the files written.
    pub fn write(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let capture = self.inner.lock();
        let mut written = Vec::new();
        for &rate in &capture.rates {
            let target = if capture.rates.len() == 1 {
                path.to_path_buf()
            } else {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
                path.with_file_name(format!("{stem}-{rate}.wav"))
            };
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer = hound::WavWriter::create(&target, spec)
                .with_context(|| format!("create {}", target.display()))?;
            for (_, samples) in capture.samples.iter().filter(|(r, _)| *r == rate) {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
            writer.finalize()?;
            written.push(target);
        }
        Ok(written)
    }
}

impl SinkFactory for WavCapture {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>, PlayerError> {
        let mut capture = self.inner.lock();
        if !capture.rates.contains(&sample_rate) {
            capture.rates.push(sample_rate);
        }
        Ok(Box::new(WavSink {
            sample_rate,
            volume: 1.0,
            capture: self.clone(),
        }))
    }
}

struct WavSink {
    sample_rate: u32,
    volume: f32,
    capture: WavCapture,
}

impl AudioSink for WavSink {
    fn append(&mut self, pcm: &[u8]) -> Result<(), PlayerError> {
        let samples = pcm
            .chunks_exact(2)
            .map(|b| {
                let s = f32::from(i16::from_le_bytes([b[0], b[1]])) * self.volume;
                s.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
            })
            .collect();
        self.capture.inner.lock().samples.push((self.sample_rate, samples));
        Ok(())
    }

    /// Appended audio counts as played at once, so nothing is ever pending.
    fn queued(&self) -> usize {
        0
    }

    /// Nothing is pending, so there is nothing to drop. Audio that reached
    /// the capture before a cancel stays in the file, the same as audio a
    /// device already played.
    fn clear(&mut self) {}

    fn set_paused(&mut self, _paused: bool) {}

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn single_rate_goes_to_the_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WavCapture::new();
        let mut sink = capture.open(22050).unwrap();
        sink.append(&pcm(&[1, -2, 300])).unwrap();
        sink.set_volume(0.5);
        sink.append(&pcm(&[1000])).unwrap();

        let path = dir.path().join("out.wav");
        assert_eq!(capture.write(&path).unwrap(), vec![path.clone()]);
        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, -2, 300, 500]);
    }

    #[test]
    fn clear_keeps_audio_already_captured() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WavCapture::new();
        let mut sink = capture.open(16000).unwrap();
        sink.append(&pcm(&[7, 8])).unwrap();
        assert_eq!(sink.queued(), 0);
        sink.clear();
        sink.append(&pcm(&[9])).unwrap();

        let path = dir.path().join("out.wav");
        capture.write(&path).unwrap();
        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![7, 8, 9]);
    }

    #[test]
    fn several_rates_get_one_file_each() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WavCapture::new();
        capture.open(22050).unwrap().append(&pcm(&[1])).unwrap();
        capture.open(16000).unwrap().append(&pcm(&[2, 3])).unwrap();
        let written = capture.write(&dir.path().join("speech.wav")).unwrap();
        assert_eq!(
            written,
            vec![dir.path().join("speech-22050.wav"), dir.path().join("speech-16000.wav")]
        );
        let reader = hound::WavReader::open(&written[1]).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 2);
    }
}
