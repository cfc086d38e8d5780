//! Audio output: one player per sample rate, created on first use.
//!
//! Every call here may block and is meant to run on the worker pool. Writes
//! and `stop` on one player go through the same lock, and the cancellation
//! token is checked under it, so nothing is appended after a stop that
//! followed a cancel.

use crate::error::PlayerError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A feed waits while a sink already holds this many unplayed buffers.
pub const MAX_QUEUED_BUFFERS: usize = 8;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Output device for 16-bit little-endian mono PCM at one sample rate.
pub trait AudioSink: Send {
    fn append(&mut self, pcm: &[u8]) -> Result<(), PlayerError>;
    /// Buffers appended but not yet played.
    fn queued(&self) -> usize;
    /// Drop queued audio without playing it.
    fn clear(&mut self);
    fn set_paused(&mut self, paused: bool);
    fn set_volume(&mut self, volume: f32);
    fn close(&mut self) {}
}

pub trait SinkFactory: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>, PlayerError>;
}

struct PlayerState {
    sink: Box<dyn AudioSink>,
    closed: bool,
}

pub struct Player {
    sample_rate: u32,
    state: Mutex<PlayerState>,
}

impl Player {
    fn new(sample_rate: u32, sink: Box<dyn AudioSink>) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(PlayerState { sink, closed: false }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns whether the buffer was queued; `false` when cancelled first.
    pub fn feed(&self, pcm: &[u8], cancel: &CancellationToken) -> Result<bool, PlayerError> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PlayerError::Closed);
                }
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                if state.sink.queued() < MAX_QUEUED_BUFFERS {
                    state.sink.append(pcm)?;
                    return Ok(true);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until everything queued has played, or until cancelled/closed.
    pub fn idle(&self, cancel: &CancellationToken) {
        loop {
            {
                let state = self.state.lock();
                if state.closed || cancel.is_cancelled() || state.sink.queued() == 0 {
                    return;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.sink.clear();
        }
    }

    pub fn pause(&self, paused: bool) {
        let mut state = self.state.lock();
        if !state.closed {
            state.sink.set_paused(paused);
        }
    }

    fn set_volume(&self, volume: f32) {
        let mut state = self.state.lock();
        if !state.closed {
            state.sink.set_volume(volume);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.sink.clear();
            state.sink.close();
            state.closed = true;
        }
    }
}

/// Players keyed by sample rate, shared by every plan.
pub struct PlayerPool {
    factory: Arc<dyn SinkFactory>,
    players: Mutex<HashMap<u32, Arc<Player>>>,
    volume: Mutex<f32>,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl PlayerPool {
    pub fn new(factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            factory,
            players: Mutex::new(HashMap::new()),
            volume: Mutex::new(1.0),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Existing player for `sample_rate`, or a new one with the pool's volume and pause state.
    pub fn player(&self, sample_rate: u32) -> Result<Arc<Player>, PlayerError> {
        let mut players = self.players.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlayerError::Closed);
        }
        if let Some(p) = players.get(&sample_rate) {
            return Ok(Arc::clone(p));
        }
        let mut sink = self.factory.open(sample_rate)?;
        sink.set_volume(*self.volume.lock());
        if self.paused.load(Ordering::SeqCst) {
            sink.set_paused(true);
        }
        tracing::debug!(sample_rate, "audio player created");
        let player = Arc::new(Player::new(sample_rate, sink));
        players.insert(sample_rate, Arc::clone(&player));
        Ok(player)
    }

    fn existing(&self, sample_rate: u32) -> Option<Arc<Player>> {
        self.players.lock().get(&sample_rate).cloned()
    }

    fn all(&self) -> Vec<Arc<Player>> {
        self.players.lock().values().cloned().collect()
    }

    pub fn feed(&self, sample_rate: u32, pcm: &[u8], cancel: &CancellationToken) -> Result<bool, PlayerError> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.player(sample_rate)?.feed(pcm, cancel)
    }

    pub fn idle(&self, sample_rate: u32, cancel: &CancellationToken) {
        if let Some(p) = self.existing(sample_rate) {
            p.idle(cancel);
        }
    }

    pub fn idle_all(&self, cancel: &CancellationToken) {
        for p in self.all() {
            p.idle(cancel);
        }
    }

    pub fn stop(&self, sample_rate: u32) {
        if let Some(p) = self.existing(sample_rate) {
            p.stop();
        }
    }

    pub fn stop_all(&self) {
        for p in self.all() {
            p.stop();
        }
    }

    pub fn pause(&self, sample_rate: u32, paused: bool) {
        if let Some(p) = self.existing(sample_rate) {
            p.pause(paused);
        }
    }

    pub fn pause_all(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        for p in self.all() {
            p.pause(paused);
        }
    }

    /// 0.0..=1.0; also used for players created later.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.volume.lock() = volume;
        for p in self.all() {
            p.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every player. Waits for a write in progress on each one; later feeds fail.
    pub fn close_all(&self) {
        let players: Vec<Arc<Player>> = {
            let mut players = self.players.lock();
            self.closed.store(true, Ordering::SeqCst);
            players.drain().map(|(_, p)| p).collect()
        };
        for p in players {
            p.close();
        }
    }
}

#[cfg(feature = "playback")]
pub use self::rodio_output::RodioOutput;

#[cfg(feature = "playback")]
mod rodio_output {
    use super::{AudioSink, SinkFactory};
    use crate::error::PlayerError;
    use std::sync::mpsc;

    type SinkReply = mpsc::Sender<Result<rodio::Sink, PlayerError>>;

    /// Default output device. The device stream lives on its own thread and
    /// hands out sinks on request.
    pub struct RodioOutput {
        requests: parking_lot::Mutex<mpsc::Sender<SinkReply>>,
    }

    impl RodioOutput {
        pub fn open_default() -> Result<Self, PlayerError> {
            let (requests, rx) = mpsc::channel::<SinkReply>();
            let (ready_tx, ready_rx) = mpsc::channel::<Result<(), PlayerError>>();
            std::thread::Builder::new()
                .name("sonata-audio".into())
                .spawn(move || {
                    let stream = match rodio::OutputStreamBuilder::open_default_stream() {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(PlayerError::Device(e.to_string())));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    while let Ok(reply) = rx.recv() {
                        let _ = reply.send(Ok(rodio::Sink::connect_new(stream.mixer())));
                    }
                })
                .map_err(|e| PlayerError::Device(e.to_string()))?;
            ready_rx
                .recv()
                .map_err(|_| PlayerError::Device("audio thread exited".into()))??;
            Ok(Self {
                requests: parking_lot::Mutex::new(requests),
            })
        }
    }

    impl SinkFactory for RodioOutput {
        fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>, PlayerError> {
            let (tx, rx) = mpsc::channel();
            self.requests
                .lock()
                .send(tx)
                .map_err(|_| PlayerError::Device("audio thread exited".into()))?;
            let sink = rx
                .recv()
                .map_err(|_| PlayerError::Device("audio thread exited".into()))??;
            Ok(Box::new(RodioSink {
                sink,
                sample_rate,
                paused: false,
            }))
        }
    }

    struct RodioSink {
        sink: rodio::Sink,
        sample_rate: u32,
        paused: bool,
    }

    impl AudioSink for RodioSink {
        fn append(&mut self, pcm: &[u8]) -> Result<(), PlayerError> {
            let samples: Vec<f32> = pcm
                .chunks_exact(2)
                .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
                .collect();
            if samples.is_empty() {
                return Ok(());
            }
            self.sink
                .append(rodio::buffer::SamplesBuffer::new(1, self.sample_rate, samples));
            Ok(())
        }

        fn queued(&self) -> usize {
            self.sink.len()
        }

        fn clear(&mut self) {
            // clear() leaves the sink paused.
            self.sink.clear();
            if !self.paused {
                self.sink.play();
            }
        }

        fn set_paused(&mut self, paused: bool) {
            self.paused = paused;
            if paused {
                self.sink.pause();
            } else {
                self.sink.play();
            }
        }

        fn set_volume(&mut self, volume: f32) {
            self.sink.set_volume(volume);
        }

        fn close(&mut self) {
            self.sink.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSinks, SinkEvent};
    use std::time::Instant;

    fn pool() -> (PlayerPool, RecordingSinks) {
        let sinks = RecordingSinks::default();
        (PlayerPool::new(Arc::new(sinks.clone())), sinks)
    }

    #[test]
    fn feed_creates_one_player_per_rate() {
        let (pool, sinks) = pool();
        let token = CancellationToken::new();
        assert!(pool.feed(22050, b"ab", &token).unwrap());
        assert!(pool.feed(22050, b"cd", &token).unwrap());
        assert!(pool.feed(16000, b"ef", &token).unwrap());
        assert_eq!(sinks.opened(), vec![22050, 16000]);
        assert_eq!(sinks.audio(22050), b"abcd");
        assert_eq!(sinks.audio(16000), b"ef");
    }

    #[test]
    fn cancelled_feed_appends_nothing() {
        let (pool, sinks) = pool();
        let token = CancellationToken::new();
        token.cancel();
        assert!(!pool.feed(22050, b"ab", &token).unwrap());
        assert!(sinks.audio(22050).is_empty());
    }

    #[test]
    fn feed_waits_for_queue_space() {
        let (pool, sinks) = pool();
        sinks.hold(true);
        let token = CancellationToken::new();
        for _ in 0..MAX_QUEUED_BUFFERS {
            pool.feed(8000, b"xx", &token).unwrap();
        }
        let releaser = {
            let sinks = sinks.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                sinks.hold(false);
            })
        };
        let started = Instant::now();
        assert!(pool.feed(8000, b"yy", &token).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(40));
        releaser.join().unwrap();
    }

    #[test]
    fn cancel_unblocks_waiting_feed() {
        let (pool, sinks) = pool();
        sinks.hold(true);
        let token = CancellationToken::new();
        for _ in 0..MAX_QUEUED_BUFFERS {
            pool.feed(8000, b"xx", &token).unwrap();
        }
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        assert!(!pool.feed(8000, b"yy", &token).unwrap());
        canceller.join().unwrap();
    }

    #[test]
    fn stop_discards_and_idle_returns() {
        let (pool, sinks) = pool();
        sinks.hold(true);
        let token = CancellationToken::new();
        pool.feed(8000, b"xx", &token).unwrap();
        pool.stop_all();
        assert_eq!(sinks.queued(8000), 0);
        pool.idle_all(&token);
        assert!(sinks.events().contains(&SinkEvent::Cleared(8000)));
    }

    #[test]
    fn volume_and_pause_apply_to_new_players() {
        let (pool, sinks) = pool();
        pool.set_volume(0.5);
        pool.pause_all(true);
        pool.feed(8000, b"xx", &CancellationToken::new()).unwrap();
        let events = sinks.events();
        assert!(events.contains(&SinkEvent::Volume(8000, 0.5)));
        assert!(events.contains(&SinkEvent::Paused(8000, true)));
        pool.set_volume(3.0);
        assert_eq!(pool.volume(), 1.0);
    }

    #[test]
    fn close_all_rejects_later_feeds() {
        let (pool, sinks) = pool();
        let token = CancellationToken::new();
        pool.feed(8000, b"xx", &token).unwrap();
        pool.close_all();
        pool.close_all();
        assert!(pool.is_closed());
        assert!(matches!(pool.feed(8000, b"yy", &token), Err(PlayerError::Closed)));
        assert!(sinks.events().contains(&SinkEvent::Closed(8000)));
    }
}
