//! Mount lifecycle supervision
//!
//! One [`Supervisor`] exists per process invocation. It drives the
//! mount sequence strictly in order on the calling thread: acquire the
//! mountpoint, initialize the volume driver, begin dispatch, wait for
//! kernel readiness. Every failure routes through a single cleanup arm
//! that force-unmounts when, and only when, the mount was acquired.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::diag::Diagnostics;
use crate::error::MountError;
use crate::gateway::{MountGateway, MountHandle};
use crate::options::MountOptions;
use crate::volume::Volume;

/// Progress of the single mount run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unmounted,
    Mounted,
    DriverInitialized,
    Serving,
    Ready,
    Failed,
    CleanedUp,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unmounted => "unmounted",
            LifecycleState::Mounted => "mounted",
            LifecycleState::DriverInitialized => "driver-initialized",
            LifecycleState::Serving => "serving",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
            LifecycleState::CleanedUp => "cleaned-up",
        }
    }
}

/// Read-only view of the supervisor's progress, shared with the
/// diagnostics endpoint. The supervisor is the only writer.
pub struct StatusBoard {
    state: Mutex<LifecycleState>,
    started: Instant,
}

impl StatusBoard {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Unmounted),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&self, next: LifecycleState) {
        debug!(state = next.as_str(), "lifecycle transition");
        *self.state.lock() = next;
    }
}

/// The central state machine of a mount run.
pub struct Supervisor<G: MountGateway> {
    gateway: G,
    mountpoint: PathBuf,
    options: MountOptions,
    board: Arc<StatusBoard>,
}

impl<G: MountGateway> Supervisor<G> {
    pub fn new(gateway: G, mountpoint: PathBuf, options: MountOptions) -> Self {
        Self {
            gateway,
            mountpoint,
            options,
            board: Arc::new(StatusBoard::new()),
        }
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.board.state()
    }

    /// Run the mount sequence to the ready state and hand back the live
    /// handle. On failure the cleanup arm runs exactly once and the
    /// original stage error is returned unchanged.
    pub fn run<V: Volume>(
        &mut self,
        volume: V,
        diagnostics: &mut Diagnostics,
    ) -> Result<G::Handle, MountError> {
        match self.attempt(volume, diagnostics) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.board.advance(LifecycleState::Failed);
                if err.needs_unmount() {
                    if let Err(unmount_err) = self.gateway.unmount(&self.mountpoint) {
                        // Logged only: the triggering error stays the one reported.
                        error!(error = %unmount_err, "cleanup unmount failed");
                    }
                    self.board.advance(LifecycleState::CleanedUp);
                }
                Err(err)
            }
        }
    }

    fn attempt<V: Volume>(
        &mut self,
        mut volume: V,
        diagnostics: &mut Diagnostics,
    ) -> Result<G::Handle, MountError> {
        let mut handle = self
            .gateway
            .mount(&self.mountpoint, &self.options)
            .map_err(|source| MountError::Acquisition {
                path: self.mountpoint.clone(),
                source,
            })?;
        self.board.advance(LifecycleState::Mounted);

        volume.initialize().map_err(MountError::DriverInit)?;
        self.board.advance(LifecycleState::DriverInitialized);

        self.gateway
            .serve(&mut handle, volume)
            .map_err(|source| MountError::ServeStart {
                path: self.mountpoint.clone(),
                source,
            })?;
        self.board.advance(LifecycleState::Serving);

        handle.ready().map_err(MountError::AsyncMount)?;
        self.board.advance(LifecycleState::Ready);
        info!(mountpoint = ?self.mountpoint, "mount established");

        // Snapshot only once the mount is up, so it reflects
        // post-initialization memory.
        diagnostics.heap_snapshot();

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::gateway::{MountGateway, MountHandle};
    use crate::volume::{Volume, VolumeError};
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        mounts: AtomicUsize,
        serves: AtomicUsize,
        readies: AtomicUsize,
        unmounts: AtomicUsize,
    }

    #[derive(Clone, Copy, Default)]
    struct Script {
        fail_mount: bool,
        fail_serve: bool,
        fail_ready: bool,
    }

    struct MockGateway {
        counters: Arc<Counters>,
        script: Script,
    }

    impl MockGateway {
        fn new(script: Script) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                script,
            }
        }
    }

    struct MockHandle {
        counters: Arc<Counters>,
        fail_ready: bool,
    }

    impl MountHandle for MockHandle {
        fn ready(&mut self) -> io::Result<()> {
            self.counters.readies.fetch_add(1, Ordering::SeqCst);
            if self.fail_ready {
                Err(io::Error::new(io::ErrorKind::Other, "mountpoint busy"))
            } else {
                Ok(())
            }
        }

        fn join(self) -> io::Result<()> {
            Ok(())
        }
    }

    impl MountGateway for MockGateway {
        type Handle = MockHandle;

        fn mount(&self, _mountpoint: &Path, _options: &MountOptions) -> io::Result<MockHandle> {
            self.counters.mounts.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_mount {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(MockHandle {
                counters: self.counters.clone(),
                fail_ready: self.script.fail_ready,
            })
        }

        fn serve<V: Volume>(&self, _handle: &mut MockHandle, _volume: V) -> io::Result<()> {
            self.counters.serves.fetch_add(1, Ordering::SeqCst);
            if self.script.fail_serve {
                return Err(io::Error::new(io::ErrorKind::Other, "spawn failed"));
            }
            Ok(())
        }

        fn unmount(&self, _mountpoint: &Path) -> io::Result<()> {
            self.counters.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockVolume {
        fail_init: bool,
    }

    impl fuser::Filesystem for MockVolume {}

    impl Volume for MockVolume {
        fn initialize(&mut self) -> Result<(), VolumeError> {
            if self.fail_init {
                Err(VolumeError::Auth("simulated auth failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn options() -> MountOptions {
        use crate::cli::MountArgs;
        use crate::config::MountConfig;
        use crate::env::EnvOverlay;

        let args = MountArgs {
            device: Some("volume".to_string()),
            mountpoint: Some(PathBuf::from("/mnt/storage")),
            ..MountArgs::default()
        };
        let config = MountConfig::resolve(&args, None, &EnvOverlay::default())
            .unwrap()
            .normalized()
            .unwrap();
        crate::options::mount_options(&config)
    }

    fn run_scripted(
        script: Script,
        fail_init: bool,
    ) -> (Result<MockHandle, MountError>, Arc<Counters>, LifecycleState) {
        let gateway = MockGateway::new(script);
        let counters = gateway.counters.clone();
        let mut supervisor = Supervisor::new(gateway, PathBuf::from("/mnt/storage"), options());
        let mut diagnostics = Diagnostics::disabled(supervisor.board());
        let outcome = supervisor.run(MockVolume { fail_init }, &mut diagnostics);
        let state = supervisor.state();
        (outcome, counters, state)
    }

    #[test]
    fn happy_path_reaches_ready() {
        let (outcome, counters, state) = run_scripted(Script::default(), false);
        assert!(outcome.is_ok());
        assert_eq!(state, LifecycleState::Ready);
        assert_eq!(counters.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.serves.load(Ordering::SeqCst), 1);
        assert_eq!(counters.readies.load(Ordering::SeqCst), 1);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn acquisition_failure_skips_cleanup() {
        let script = Script {
            fail_mount: true,
            ..Script::default()
        };
        let (outcome, counters, state) = run_scripted(script, false);
        assert!(matches!(outcome, Err(MountError::Acquisition { .. })));
        assert_eq!(state, LifecycleState::Failed);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.serves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn driver_failure_unmounts_exactly_once() {
        let (outcome, counters, state) = run_scripted(Script::default(), true);
        let err = outcome.err().expect("driver failure must be fatal");
        assert!(matches!(err, MountError::DriverInit(_)));
        assert!(err.to_string().contains("simulated auth failure"));
        assert_eq!(state, LifecycleState::CleanedUp);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.serves.load(Ordering::SeqCst), 0);
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn serve_failure_unmounts() {
        let script = Script {
            fail_serve: true,
            ..Script::default()
        };
        let (outcome, counters, state) = run_scripted(script, false);
        assert!(matches!(outcome, Err(MountError::ServeStart { .. })));
        assert_eq!(state, LifecycleState::CleanedUp);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kernel_rejection_unmounts() {
        let script = Script {
            fail_ready: true,
            ..Script::default()
        };
        let (outcome, counters, state) = run_scripted(script, false);
        assert!(matches!(outcome, Err(MountError::AsyncMount(_))));
        assert_eq!(state, LifecycleState::CleanedUp);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_configuration_never_touches_the_gateway() {
        use crate::cli::MountArgs;
        use crate::config::MountConfig;
        use crate::env::EnvOverlay;

        let gateway = MockGateway::new(Script::default());
        let counters = gateway.counters.clone();

        // Empty device, valid mountpoint: resolution fails before any
        // supervisor exists, so the gateway is never invoked.
        let args = MountArgs {
            device: Some(String::new()),
            mountpoint: Some(PathBuf::from("/mnt/storage")),
            ..MountArgs::default()
        };
        let err = MountConfig::resolve(&args, None, &EnvOverlay::default()).unwrap_err();
        assert!(matches!(err, MountError::MissingOption("device")));

        assert_eq!(counters.mounts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.unmounts.load(Ordering::SeqCst), 0);
        drop(gateway);
    }
}
