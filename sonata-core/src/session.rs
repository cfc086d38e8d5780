//! Engine session: the supervised process plus the single client connection to it.

use crate::client::EngineClient;
use crate::config::EngineConfig;
use crate::error::{DriverError, EngineError};
use crate::supervisor::EngineSupervisor;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;

pub struct EngineSession {
    supervisor: tokio::sync::Mutex<EngineSupervisor>,
    client: Mutex<Option<EngineClient>>,
    /// Engine version, or why the engine is unusable. Decided once.
    availability: OnceCell<Result<String, String>>,
    connect_timeout: Duration,
}

impl EngineSession {
    pub fn new(config: EngineConfig) -> Self {
        let connect_timeout = config.connect_timeout();
        Self {
            supervisor: tokio::sync::Mutex::new(EngineSupervisor::new(config)),
            client: Mutex::new(None),
            availability: OnceCell::new(),
            connect_timeout,
        }
    }

    /// Start (or attach to) the engine, connect, and check it answers. The
    /// outcome is cached: later calls return it without retrying.
    pub async fn init(&self) -> Result<String, DriverError> {
        if self.client.lock().is_some() {
            tracing::warn!("attempted to re-initialize an already initialized engine connection");
        }
        let outcome = self
            .availability
            .get_or_init(|| async move {
                match self.connect().await {
                    Ok(version) => Ok(version),
                    Err(e) => {
                        tracing::error!(error = %e, "engine unavailable, synthesizer disabled");
                        Err(e.to_string())
                    }
                }
            })
            .await;
        outcome.clone().map_err(DriverError::Unavailable)
    }

    async fn connect(&self) -> Result<String, EngineError> {
        let addr = {
            let mut supervisor = self.supervisor.lock().await;
            supervisor.ensure_started()?;
            supervisor.address().ok_or(EngineError::Disconnected)?
        };
        let client = EngineClient::connect_with_retry(addr, self.connect_timeout).await?;
        let version = match client.check_reachable(self.connect_timeout).await {
            Ok(v) => v,
            Err(e) => {
                client.close();
                return Err(e);
            }
        };
        tracing::info!(%addr, %version, "connected to engine");
        *self.client.lock() = Some(client);
        Ok(version)
    }

    /// Cached result of [`init`](Self::init); `None` before the first attempt.
    pub fn availability(&self) -> Option<Result<&str, &str>> {
        self.availability
            .get()
            .map(|r| r.as_ref().map(String::as_str).map_err(String::as_str))
    }

    pub fn client(&self) -> Result<EngineClient, DriverError> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| DriverError::Unavailable("engine not connected".to_string()))
    }

    pub async fn port(&self) -> Option<u16> {
        self.supervisor.lock().await.port()
    }

    /// Close the connection and stop the engine. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if let Some(client) = self.client.lock().take() {
            client.close();
        }
        self.supervisor.lock().await.terminate().await;
    }
}
