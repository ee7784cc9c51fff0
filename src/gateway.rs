//! OS mount facility
//!
//! The lifecycle supervisor consumes the kernel's FUSE machinery through
//! the [`MountGateway`] and [`MountHandle`] traits so tests can stand in
//! a scripted gateway. [`FuseGateway`] is the production implementation
//! on top of `fuser`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{Receiver, SyncSender};
use std::thread;

use fuser::{MountOption, Session};
use tracing::{debug, info};

use crate::options::{MountFlag, MountOptions};
use crate::volume::Volume;

/// OS mount facility consumed by the lifecycle supervisor.
pub trait MountGateway {
    type Handle: MountHandle;

    /// Acquire the mountpoint. Failures here are fatal and need no
    /// cleanup beyond what the OS already guarantees.
    fn mount(&self, mountpoint: &Path, options: &MountOptions) -> io::Result<Self::Handle>;

    /// Bind the volume to the mount handle and begin dispatching
    /// filesystem calls. Returns once dispatch is underway; an error
    /// means dispatch could not start at all.
    fn serve<V: Volume>(&self, handle: &mut Self::Handle, volume: V) -> io::Result<()>;

    /// Detach the mountpoint. Used both for external termination and for
    /// the failure-path cleanup.
    fn unmount(&self, mountpoint: &Path) -> io::Result<()>;
}

/// Handle to one acquired mount.
pub trait MountHandle {
    /// Block until the kernel has settled the mount. An error means the
    /// kernel rejected the mount after dispatch had already started.
    fn ready(&mut self) -> io::Result<()>;

    /// Block until serving ends (external unmount or signal).
    fn join(self) -> io::Result<()>;
}

/// Production gateway backed by `fuser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseGateway;

#[derive(Debug)]
pub struct FuseHandle {
    mountpoint: PathBuf,
    options: Vec<MountOption>,
    worker: Option<thread::JoinHandle<io::Result<()>>>,
    established: Option<Receiver<io::Result<()>>>,
}

impl MountGateway for FuseGateway {
    type Handle = FuseHandle;

    fn mount(&self, mountpoint: &Path, options: &MountOptions) -> io::Result<FuseHandle> {
        if !mountpoint.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mountpoint does not exist: {mountpoint:?}"),
            ));
        }
        if !mountpoint.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("mountpoint is not a directory: {mountpoint:?}"),
            ));
        }

        let options = to_fuse_options(options);
        debug!(?options, "mount options");

        Ok(FuseHandle {
            mountpoint: mountpoint.to_path_buf(),
            options,
            worker: None,
            established: None,
        })
    }

    fn serve<V: Volume>(&self, handle: &mut FuseHandle, volume: V) -> io::Result<()> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let mountpoint = handle.mountpoint.clone();
        let options = handle.options.clone();

        let worker = thread::Builder::new()
            .name("fuse-dispatch".to_string())
            .spawn(move || dispatch(volume, mountpoint, options, tx))?;

        handle.worker = Some(worker);
        handle.established = Some(rx);
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        info!("unmounting {:?}", mountpoint);

        let output = if cfg!(target_os = "macos") {
            Command::new("umount").arg(mountpoint).output()?
        } else {
            Command::new("fusermount").arg("-u").arg(mountpoint).output()?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unmount of {mountpoint:?} failed: {}", stderr.trim()),
            ));
        }
        Ok(())
    }
}

/// Dispatch loop body, runs on the dedicated FUSE thread. The kernel
/// session is created here; its outcome is reported back through the
/// `established` channel before the loop starts.
fn dispatch<V: Volume>(
    volume: V,
    mountpoint: PathBuf,
    options: Vec<MountOption>,
    established: SyncSender<io::Result<()>>,
) -> io::Result<()> {
    let mut session = match Session::new(volume, &mountpoint, &options) {
        Ok(session) => {
            let _ = established.send(Ok(()));
            session
        }
        Err(err) => {
            let kind = err.kind();
            let _ = established.send(Err(err));
            return Err(io::Error::new(kind, "mount was rejected"));
        }
    };
    session.run()
}

impl MountHandle for FuseHandle {
    fn ready(&mut self) -> io::Result<()> {
        match self.established.take() {
            Some(rx) => match rx.recv() {
                Ok(outcome) => outcome,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "fuse dispatch thread exited before the mount settled",
                )),
            },
            // Already settled on an earlier call.
            None => Ok(()),
        }
    }

    fn join(mut self) -> io::Result<()> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "fuse dispatch thread panicked"))?,
            None => Ok(()),
        }
    }
}

/// Convert domain flags to `fuser` mount options. The kernel takes the
/// readahead bound as the `max_read` option string.
fn to_fuse_options(options: &MountOptions) -> Vec<MountOption> {
    options
        .flags()
        .iter()
        .map(|flag| match flag {
            MountFlag::AllowOther => MountOption::AllowOther,
            MountFlag::AllowRoot => MountOption::AllowRoot,
            MountFlag::DefaultPermissions => MountOption::DefaultPermissions,
            MountFlag::ReadOnly => MountOption::RO,
            MountFlag::MaxReadahead(bytes) => MountOption::CUSTOM(format!("max_read={bytes}")),
            MountFlag::Subtype(subtype) => MountOption::Subtype(subtype.to_string()),
            MountFlag::Name(name) => MountOption::FSName(name.clone()),
        })
        .collect()
}
