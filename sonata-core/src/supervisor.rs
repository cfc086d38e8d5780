//! Engine process supervisor: launches the synthesis engine detached from our
//! process group, on a free local port, with its output in a rotated log file.

use crate::config::EngineConfig;
use crate::error::EngineError;
use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

pub const PORT_ENV: &str = "SONATA_GRPC_SERVER_PORT";
pub const DATA_DIR_ENV: &str = "SONATA_ESPEAKNG_DATA_DIRECTORY";
pub const LOG_LEVEL_ENV: &str = "SONATA_GRPC";
pub const LOG_FILE_NAME: &str = "sonata-grpc.log";

struct Running {
    port: u16,
    /// `None` when attached to an engine someone else launched.
    child: Option<Child>,
}

pub struct EngineSupervisor {
    config: EngineConfig,
    running: Option<Running>,
}

impl EngineSupervisor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.port().map(|p| SocketAddr::from((Ipv4Addr::LOCALHOST, p)))
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref()?.child.as_ref()?.id()
    }

    /// True while a launched engine has not exited (attached engines count as running).
    pub fn is_running(&mut self) -> bool {
        match self.running.as_mut() {
            None => false,
            Some(Running { child: None, .. }) => true,
            Some(Running {
                child: Some(child), ..
            }) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Make sure one engine is reachable on a known port. Idempotent.
    pub fn ensure_started(&mut self) -> Result<u16, EngineError> {
        if let Some(r) = &self.running {
            tracing::debug!(port = r.port, "engine already started");
            return Ok(r.port);
        }
        if let Some(port) = self.config.attach_port {
            tracing::info!(port, "attaching to running engine");
            self.running = Some(Running { port, child: None });
            return Ok(port);
        }

        let port = find_free_port()?;
        let exe = &self.config.executable;
        let mut cmd = Command::new(exe);
        if let Some(dir) = exe.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.env(PORT_ENV, port.to_string())
            .env(DATA_DIR_ENV, &self.config.data_dir)
            .env(LOG_LEVEL_ENV, &self.config.log_level)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        let (stdout, stderr) = self.log_output();
        cmd.stdout(stdout).stderr(stderr);
        detach(&mut cmd);

        let child = cmd.spawn().map_err(|source| EngineError::Launch {
            path: exe.clone(),
            source,
        })?;
        tracing::info!(port, pid = ?child.id(), exe = %exe.display(), "engine launched");
        self.running = Some(Running {
            port,
            child: Some(child),
        });
        Ok(port)
    }

    fn log_output(&self) -> (Stdio, Stdio) {
        let path = self.config.log_dir.join(LOG_FILE_NAME);
        let opened = std::fs::create_dir_all(&self.config.log_dir)
            .and_then(|_| rotate_log(&path, self.config.log_keep))
            .and_then(|_| File::create(&path))
            .and_then(|f| Ok((f.try_clone()?, f)));
        match opened {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open engine log file for writing");
                (Stdio::null(), Stdio::null())
            }
        }
    }

    /// Ask the engine to exit, force-kill it after the grace period. A second
    /// call is a no-op; attached engines are left running.
    pub async fn terminate(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Some(mut child) = running.child else {
            tracing::debug!(port = running.port, "detaching from engine");
            return;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return;
        }
        request_exit(&mut child).await;
        match tokio::time::timeout(self.config.shutdown_grace(), child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "engine exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to wait for engine"),
            Err(_) => {
                tracing::warn!(grace = ?self.config.shutdown_grace(), "engine still alive, killing");
                force_kill(&mut child).await;
            }
        }
    }
}

/// Bind port 0 on loopback and return what the OS picked.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Shift `name.log` -> `name.log.1` -> ... keeping at most `keep` old copies.
pub fn rotate_log(path: &Path, keep: usize) -> std::io::Result<()> {
    if keep == 0 || !path.exists() {
        return Ok(());
    }
    let numbered = |n: usize| -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(format!(".{n}"));
        PathBuf::from(s)
    };
    let oldest = numbered(keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = numbered(n);
        if from.exists() {
            std::fs::rename(&from, numbered(n + 1))?;
        }
    }
    std::fs::rename(path, numbered(1))
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
async fn request_exit(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    // The engine leads its own process group; signal the whole group.
    let status = Command::new("kill")
        .arg("-TERM")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(pid, error = %e, "failed to send SIGTERM to engine");
    }
}

#[cfg(windows)]
async fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to terminate engine");
    }
}

#[cfg(unix)]
async fn force_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill engine");
    }
}

#[cfg(windows)]
async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill engine");
    }
}
