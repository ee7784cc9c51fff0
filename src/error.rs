use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::volume::VolumeError;

/// Fatal errors of the mount lifecycle.
///
/// Each variant corresponds to one stage of the startup sequence, so the
/// supervisor can match a failure once and route it to the right cleanup.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("missing mandatory option --{0}")]
    MissingOption(&'static str),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("mounting {path:?} failed: {source}")]
    Acquisition {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("filesystem initialization failed: {0}")]
    DriverInit(#[source] VolumeError),

    #[error("serving {path:?} failed: {source}")]
    ServeStart {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mount rejected by the kernel: {0}")]
    AsyncMount(#[source] io::Error),

    #[error("diagnostics endpoint failed to bind {addr}: {source}")]
    DiagnosticsBind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl MountError {
    /// Whether the mountpoint must be force-unmounted before the process
    /// exits. True exactly for failures that happen after the OS mount
    /// has been acquired.
    pub fn needs_unmount(&self) -> bool {
        matches!(
            self,
            MountError::DriverInit(_) | MountError::ServeStart { .. } | MountError::AsyncMount(_)
        )
    }

    /// Process exit code: 2 for configuration-class errors caught before
    /// the mount sequence, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            MountError::MissingOption(_)
            | MountError::InvalidOption(_)
            | MountError::DiagnosticsBind { .. } => 2,
            _ => 1,
        }
    }
}
