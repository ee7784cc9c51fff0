//! Startup diagnostics
//!
//! Three independent facilities, all optional and all started before the
//! mount sequence so they never interfere with it: a live HTTP status
//! endpoint, a sampling CPU profiler flushed on every exit path, and a
//! one-shot heap snapshot taken when the mount becomes ready.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::MountConfig;
use crate::error::MountError;
use crate::lifecycle::StatusBoard;

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("profiler error: {0}")]
    Profiler(#[from] pprof::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Owner of the optional diagnostic facilities for one mount run.
pub struct Diagnostics {
    board: Arc<StatusBoard>,
    cpu: Option<CpuProfile>,
    live: Option<LiveEndpoint>,
    heap_path: Option<PathBuf>,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("cpu", &self.cpu.is_some())
            .field("live", &self.live.is_some())
            .field("heap_path", &self.heap_path)
            .finish()
    }
}

struct LiveEndpoint {
    addr: SocketAddr,
    task: JoinHandle<io::Result<()>>,
}

impl Diagnostics {
    /// Start the configured facilities. The endpoint listener is bound
    /// here, synchronously, so a bad address fails the run before any
    /// mount attempt; only the serve loop runs in the background.
    pub fn start(
        config: &MountConfig,
        board: Arc<StatusBoard>,
        runtime: &Handle,
    ) -> Result<Self, MountError> {
        let live = match &config.profile_bind {
            Some(addr) => Some(spawn_live_endpoint(addr, board.clone(), runtime)?),
            None => None,
        };

        let cpu = match &config.profile_cpu {
            Some(path) => Some(CpuProfile::start(path.clone())?),
            None => None,
        };

        Ok(Self {
            board,
            cpu,
            live,
            heap_path: config.profile_ram.clone(),
        })
    }

    /// A controller with every facility off, for runs without
    /// diagnostics configured.
    pub fn disabled(board: Arc<StatusBoard>) -> Self {
        Self {
            board,
            cpu: None,
            live: None,
            heap_path: None,
        }
    }

    /// Address the live endpoint actually bound, if one is running.
    pub fn live_addr(&self) -> Option<SocketAddr> {
        self.live.as_ref().map(|live| live.addr)
    }

    /// Write the one-shot heap snapshot. Called by the supervisor at the
    /// ready transition; snapshot failures are logged, never fatal.
    pub fn heap_snapshot(&self) {
        let Some(path) = &self.heap_path else { return };
        match write_heap_snapshot(path, &self.board) {
            Ok(()) => info!(path = %path.display(), "heap snapshot written"),
            Err(err) => error!(error = %err, "heap snapshot failed"),
        }
    }

    /// Stop the CPU profiler and harvest the endpoint task. Idempotent;
    /// called once on every exit path through the scope guard in main.
    pub fn shutdown(&mut self) {
        if let Some(cpu) = self.cpu.as_mut() {
            cpu.stop();
        }
        if let Some(live) = self.live.take() {
            live.task.abort();
            match futures::executor::block_on(live.task) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "live profiling endpoint failed"),
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => warn!(error = %join_err, "live profiling endpoint panicked"),
            }
        }
    }
}

fn spawn_live_endpoint(
    addr: &str,
    board: Arc<StatusBoard>,
    runtime: &Handle,
) -> Result<LiveEndpoint, MountError> {
    let bind_error = |source: io::Error| MountError::DiagnosticsBind {
        addr: addr.to_string(),
        source,
    };

    let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    let local = listener.local_addr().map_err(bind_error)?;

    info!(addr = %local, "live profiling endpoint listening");

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(board);

    let task = runtime.spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        axum::serve(listener, router).await
    });

    Ok(LiveEndpoint { addr: local, task })
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(board): State<Arc<StatusBoard>>) -> Json<serde_json::Value> {
    let memory = memory_stats::memory_stats();
    Json(serde_json::json!({
        "state": board.state().as_str(),
        "uptime_secs": board.uptime().as_secs(),
        "physical_mem": memory.map(|m| m.physical_mem),
        "virtual_mem": memory.map(|m| m.virtual_mem),
    }))
}

fn write_heap_snapshot(path: &Path, board: &StatusBoard) -> Result<(), DiagnosticsError> {
    let memory = memory_stats::memory_stats();
    let snapshot = serde_json::json!({
        "state": board.state().as_str(),
        "uptime_secs": board.uptime().as_secs(),
        "physical_mem": memory.map(|m| m.physical_mem),
        "virtual_mem": memory.map(|m| m.virtual_mem),
    });
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &snapshot).map_err(io::Error::from)?;
    Ok(())
}

/// Sampling CPU profiler, running from construction until [`stop`].
///
/// The guard is released through an `Option` so the flush happens exactly
/// once no matter how many of the exit paths reach it; `Drop` covers
/// unwinding.
///
/// [`stop`]: CpuProfile::stop
pub struct CpuProfile {
    guard: Option<pprof::ProfilerGuard<'static>>,
    path: PathBuf,
}

impl CpuProfile {
    pub fn start(path: PathBuf) -> Result<Self, MountError> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(99)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .map_err(|err| {
                MountError::InvalidOption(format!(
                    "cpu profiling to {} unavailable: {err}",
                    path.display()
                ))
            })?;
        info!(path = %path.display(), "cpu profiling started");
        Ok(Self {
            guard: Some(guard),
            path,
        })
    }

    /// Stop sampling and flush the profile. Returns true when this call
    /// performed the flush; later calls are no-ops.
    pub fn stop(&mut self) -> bool {
        let Some(guard) = self.guard.take() else {
            return false;
        };
        match flush_profile(&guard, &self.path) {
            Ok(()) => info!(path = %self.path.display(), "cpu profile written"),
            Err(err) => error!(error = %err, "cpu profile flush failed"),
        }
        true
    }
}

impl Drop for CpuProfile {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_profile(guard: &pprof::ProfilerGuard<'_>, path: &Path) -> Result<(), DiagnosticsError> {
    let report = guard.report().build()?;
    let file = File::create(path)?;
    report.flamegraph(file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::MountArgs;
    use crate::env::EnvOverlay;

    fn config(profile_bind: Option<&str>) -> MountConfig {
        let args = MountArgs {
            device: Some("volume".to_string()),
            mountpoint: Some(PathBuf::from("/mnt/storage")),
            profile_bind: profile_bind.map(str::to_string),
            ..MountArgs::default()
        };
        MountConfig::resolve(&args, None, &EnvOverlay::default()).unwrap()
    }

    fn board() -> Arc<StatusBoard> {
        Arc::new(StatusBoard::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_endpoint_serves_status() {
        let config = config(Some("127.0.0.1:0"));
        let mut diagnostics =
            Diagnostics::start(&config, board(), &Handle::current()).unwrap();
        let addr = diagnostics.live_addr().expect("endpoint must be bound");

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["state"], "unmounted");

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        diagnostics.shutdown();
        // A second shutdown is a no-op.
        diagnostics.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn occupied_address_fails_to_bind() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();

        let config = config(Some(&addr.to_string()));
        let err = Diagnostics::start(&config, board(), &Handle::current()).unwrap_err();
        assert!(matches!(err, MountError::DiagnosticsBind { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn heap_snapshot_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.json");
        let board = board();

        write_heap_snapshot(&path, &board).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot["state"], "unmounted");
    }

    #[test]
    fn cpu_profile_stops_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.svg");

        let mut profile = CpuProfile::start(path.clone()).unwrap();
        // Burn a little CPU so the report has samples to fold.
        let mut total = 0u64;
        for i in 0..2_000_000u64 {
            total = total.wrapping_add(i ^ (i << 3));
        }
        assert!(total != 0);

        assert!(profile.stop(), "first stop performs the flush");
        assert!(path.exists());
        assert!(!profile.stop(), "second stop is a no-op");
        drop(profile);

        // A fresh profile on the same process also flushes once; this is
        // the fatal-path shape where the guard is dropped mid-lifecycle.
        let fatal_path = dir.path().join("cpu-fatal.svg");
        {
            let _profile = CpuProfile::start(fatal_path.clone()).unwrap();
        }
        assert!(fatal_path.exists());
    }
}
