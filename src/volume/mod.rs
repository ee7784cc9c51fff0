//! Filesystem driver collaborators
//!
//! The lifecycle supervisor treats the driver as an opaque dependency:
//! anything that can initialize itself and then answer FUSE dispatch
//! qualifies. [`SwiftVolume`] is the production driver for Swift and
//! hubiC accounts.

pub mod cache;
pub mod swift;

use fuser::Filesystem;
use thiserror::Error;

pub use swift::SwiftVolume;

/// Driver contract consumed by the supervisor.
///
/// `initialize` performs the credential exchange and the initial
/// container listing/validation; dispatch then goes through the
/// `fuser::Filesystem` supertrait once the volume is bound to a mount.
pub trait Volume: Filesystem + Send + 'static {
    fn initialize(&mut self) -> Result<(), VolumeError>;
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("container {0:?} not found")]
    UnknownContainer(String),

    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
}
