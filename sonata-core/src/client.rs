//! Engine client: typed remote calls multiplexed over a single framed connection.
//!
//! One reader task routes replies to callers by request id, one writer task
//! serializes outgoing requests. Streaming calls hand out a [`SpeechStream`]
//! that sends `cancel` to the engine if it is dropped before the end.

use crate::error::EngineError;
use crate::protocol::{
    read_frame, write_message, Call, Reply, Request, Response, SpeechArgs, SynthesisOptions,
    Utterance, VoiceInfo,
};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type ChunkResult = Result<Vec<u8>, EngineError>;

enum Pending {
    Unary(oneshot::Sender<Result<Reply, EngineError>>),
    Stream(mpsc::UnboundedSender<ChunkResult>),
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Request>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Drops the pending entry when a call ends for any reason, including the
/// caller abandoning the future. Dispatch may already have removed it.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

impl Inner {
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, pending) in self.pending.lock().drain() {
            match pending {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(EngineError::Disconnected));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(Err(EngineError::Disconnected));
                }
            }
        }
    }

    fn dispatch(&self, id: u64, reply: Reply, audio: Option<Vec<u8>>) {
        let mut pending = self.pending.lock();
        match reply {
            Reply::Audio => {
                if let Some(Pending::Stream(tx)) = pending.get(&id) {
                    if tx.send(Ok(audio.unwrap_or_default())).is_err() {
                        pending.remove(&id);
                    }
                }
            }
            Reply::End => {
                pending.remove(&id);
            }
            Reply::Error { message } => match pending.remove(&id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Err(EngineError::Remote(message)));
                }
                Some(Pending::Stream(tx)) => {
                    let _ = tx.send(Err(EngineError::Remote(message)));
                }
                None => tracing::debug!(id, %message, "engine error for unknown call"),
            },
            other => match pending.remove(&id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Ok(other));
                }
                Some(Pending::Stream(_)) => {
                    tracing::warn!(id, kind = other.kind(), "non-audio reply on a stream");
                }
                None => tracing::debug!(id, kind = other.kind(), "reply for unknown call"),
            },
        }
    }
}

/// Cheaply clonable handle to the engine connection.
#[derive(Clone)]
pub struct EngineClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl EngineClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_io(reader, writer))
    }

    /// Keep trying to connect until `deadline`; a freshly launched engine may
    /// not have bound its port yet.
    pub async fn connect_with_retry(addr: SocketAddr, deadline: Duration) -> Result<Self, EngineError> {
        let started = Instant::now();
        loop {
            match Self::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) if started.elapsed() < deadline => {
                    tracing::trace!(%addr, error = %e, "engine not accepting connections yet");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(EngineError::Unreachable(format!("connect {addr}: {e}"))),
            }
        }
    }

    /// Run the client over any byte stream pair.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let writer_task = tokio::spawn(write_loop(writer, rx, Arc::downgrade(&inner)));
        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));
        inner.tasks.lock().extend([writer_task, reader_task]);
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tear down the connection. Calls still in flight fail with `Disconnected`.
    pub fn close(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.fail_all();
    }

    fn send(&self, id: u64, call: Call) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Disconnected);
        }
        self.inner
            .outgoing
            .send(Request { id, call })
            .map_err(|_| EngineError::Disconnected)
    }

    async fn call(&self, call: Call) -> Result<Reply, EngineError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, Pending::Unary(tx));
        let _guard = PendingGuard { inner: &self.inner, id };
        self.send(id, call)?;
        rx.await.map_err(|_| EngineError::Disconnected)?
    }

    pub async fn get_version(&self) -> Result<String, EngineError> {
        match self.call(Call::GetVersion).await? {
            Reply::Version { version } => Ok(version),
            other => Err(unexpected("get_version", other)),
        }
    }

    /// `get_version` under a deadline. Not retried here.
    pub async fn check_reachable(&self, timeout: Duration) -> Result<String, EngineError> {
        match tokio::time::timeout(timeout, self.get_version()).await {
            Ok(Ok(version)) => Ok(version),
            Ok(Err(e)) => Err(EngineError::Unreachable(e.to_string())),
            Err(_) => Err(EngineError::Unreachable(
                EngineError::Timeout(timeout).to_string(),
            )),
        }
    }

    pub async fn load_voice(&self, config_path: &str) -> Result<VoiceInfo, EngineError> {
        let call = Call::LoadVoice {
            config_path: config_path.to_string(),
        };
        match self.call(call).await? {
            Reply::VoiceInfo(info) => Ok(info),
            other => Err(unexpected("load_voice", other)),
        }
    }

    pub async fn get_synthesis_options(&self, voice_id: &str) -> Result<SynthesisOptions, EngineError> {
        let call = Call::GetSynthesisOptions {
            voice_id: voice_id.to_string(),
        };
        match self.call(call).await? {
            Reply::SynthesisOptions(options) => Ok(options),
            other => Err(unexpected("get_synthesis_options", other)),
        }
    }

    /// Partial update: fields left as `None` keep their engine-side value.
    pub async fn set_synthesis_options(
        &self,
        voice_id: &str,
        options: SynthesisOptions,
    ) -> Result<(), EngineError> {
        let call = Call::SetSynthesisOptions {
            voice_id: voice_id.to_string(),
            options,
        };
        match self.call(call).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("set_synthesis_options", other)),
        }
    }

    /// Start a server-streaming synthesis call. Chunks are pulled lazily from the
    /// returned stream.
    pub fn synthesize(
        &self,
        voice_id: &str,
        text: &str,
        args: SpeechArgs,
        streaming: bool,
    ) -> Result<SpeechStream, EngineError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(id, Pending::Stream(tx));
        let call = Call::SynthesizeUtterance {
            utterance: Utterance::new(voice_id, text, args),
            realtime: streaming,
        };
        if let Err(e) = self.send(id, call) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(SpeechStream {
            id,
            rx,
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }
}

fn unexpected(call: &'static str, reply: Reply) -> EngineError {
    EngineError::UnexpectedReply {
        call,
        reply: reply.kind().to_string(),
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Request>, inner: Weak<Inner>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &request).await {
            tracing::warn!(error = %e, method = request.call.name(), "failed to write to engine");
            break;
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.fail_all();
    }
}

async fn read_loop<R>(mut reader: R, inner: Weak<Inner>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("engine closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from engine");
                break;
            }
        };
        let response: Response = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable engine message");
                break;
            }
        };
        let audio = if matches!(response.reply, Reply::Audio) {
            match read_frame(&mut reader).await {
                Ok(Some(pcm)) => Some(pcm),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read audio frame");
                    break;
                }
            }
        } else {
            None
        };
        let Some(inner) = inner.upgrade() else { return };
        inner.dispatch(response.id, response.reply, audio);
    }
    if let Some(inner) = inner.upgrade() {
        inner.fail_all();
    }
}

/// PCM chunks of one synthesis call, in engine order.
pub struct SpeechStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChunkResult>,
    inner: Arc<Inner>,
    finished: bool,
}

impl Stream for SpeechStream {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl Drop for SpeechStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.inner.pending.lock().remove(&self.id).is_some() && !self.inner.closed.load(Ordering::SeqCst) {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.outgoing.send(Request {
                id,
                call: Call::Cancel { target: self.id },
            });
        }
    }
}
