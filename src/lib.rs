//! swiftmount: mount Swift or hubiC object storage as a local device
//!
//! The crate is organized around one mount run per process:
//!
//! - **Resolver** (`config`, `env`, `cli`): merges defaults, the config
//!   file, environment variables and command-line flags into one
//!   `MountConfig`, with per-field precedence.
//! - **Option builder** (`options`): derives the immutable OS-level
//!   mount flag list.
//! - **Supervisor** (`lifecycle`): drives mount acquisition, driver
//!   initialization, dispatch start and kernel readiness, with a single
//!   cleanup path for every failure stage.
//! - **Gateway** (`gateway`): the FUSE machinery behind a trait, so the
//!   supervisor can be exercised against scripted collaborators.
//! - **Volume** (`volume`): the filesystem driver collaborator; the
//!   production implementation speaks Swift and hubiC.
//! - **Diagnostics** (`diag`): live status endpoint, CPU profile and
//!   heap snapshot, attached around the mount sequence.

pub mod cli;
pub mod config;
pub mod diag;
pub mod env;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod options;
pub mod volume;

pub use error::MountError;
