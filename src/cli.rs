//! Command-line surface

use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "swiftmount",
    version,
    about = "Mount Swift or hubiC object storage as a local filesystem device"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mount object storage as a device at the given mountpoint
    Mount(MountArgs),
}

/// Flags of the `mount` subcommand.
///
/// Credential and connection flags are optional here even when mandatory
/// overall: the resolver merges them with the config file and the
/// environment before validating, so an unset flag falls through
/// per-field instead of masking lower-precedence sources.
#[derive(Debug, Args, Clone)]
pub struct MountArgs {
    /// Device name
    #[arg(long)]
    pub device: Option<String>,

    /// Mountpoint
    #[arg(long)]
    pub mountpoint: Option<PathBuf>,

    /// Configuration file (default: ~/.swiftmount.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    // Swift options
    /// Authentication URL
    #[arg(long = "os-auth-url")]
    pub auth_url: Option<String>,

    /// Container name
    #[arg(long = "os-container-name")]
    pub container: Option<String>,

    /// Authentication token
    #[arg(long = "os-auth-token")]
    pub auth_token: Option<String>,

    /// Username
    #[arg(long = "os-username")]
    pub username: Option<String>,

    /// User password
    #[arg(long = "os-password")]
    pub password: Option<String>,

    /// Tenant name
    #[arg(long = "os-tenant-name")]
    pub tenant: Option<String>,

    /// Domain name
    #[arg(long = "os-domain-name")]
    pub domain: Option<String>,

    /// Region name
    #[arg(long = "os-region-name")]
    pub region: Option<String>,

    /// Storage URL
    #[arg(long = "os-storage-url")]
    pub storage_url: Option<String>,

    /// Only show containers using this storage policy
    #[arg(long = "os-storage-policy")]
    pub storage_policy: Option<String>,

    /// Authentication version, 0 = auto
    #[arg(long = "os-auth-version", default_value_t = 0)]
    pub auth_version: u32,

    /// Connection timeout
    #[arg(long = "os-connect-timeout", default_value = "15s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Storage operation timeout
    #[arg(long = "os-request-timeout", default_value = "5m", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Segment size in MiB
    #[arg(long = "os-segment-size", default_value_t = defaults::SEGMENT_SIZE_MIB)]
    pub segment_size: u64,

    // hubiC options
    /// hubiC authorization code
    #[arg(long = "hubic-authorization")]
    pub hubic_authorization: Option<String>,

    /// hubiC refresh token
    #[arg(long = "hubic-refresh-token")]
    pub hubic_refresh_token: Option<String>,

    // Permissions
    /// Default UID (default: current user)
    #[arg(long = "default-uid")]
    pub uid: Option<u32>,

    /// Default GID (default: current group)
    #[arg(long = "default-gid")]
    pub gid: Option<u32>,

    /// Default permissions, octal
    #[arg(long = "default-mode", default_value = "0700", value_parser = parse_octal)]
    pub mode: u32,

    /// Fuse allow_root option
    #[arg(long = "allow-root")]
    pub allow_root: bool,

    /// Fuse allow_other option
    #[arg(
        long = "allow-other",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub allow_other: bool,

    /// Fuse default_permissions option
    #[arg(
        long = "default-permissions",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub default_permissions: bool,

    /// Read only access
    #[arg(long = "read-only")]
    pub read_only: bool,

    // Prefetch
    /// Directory listing concurrency
    #[arg(long = "readdir-concurrency", default_value_t = defaults::READDIR_CONCURRENCY)]
    pub readdir_concurrency: usize,

    /// Fetch base attributes while listing
    #[arg(long = "readdir-base-attributes")]
    pub fetch_attributes: bool,

    /// Fetch extended attributes while listing
    #[arg(long = "readdir-extended-attributes")]
    pub fetch_extended_attributes: bool,

    /// Block size in bytes
    #[arg(long = "block-size", default_value_t = defaults::BLOCK_SIZE)]
    pub block_size: u32,

    /// Per file readahead size in KiB
    #[arg(long = "readahead-size", default_value_t = defaults::READAHEAD_SIZE_KIB)]
    pub readahead_size: u32,

    // Cache options
    /// Cache timeout
    #[arg(long = "cache-ttl", default_value = "1m", value_parser = humantime::parse_duration)]
    pub cache_ttl: Duration,

    /// Maximum overall entries allowed in cache, -1 = unlimited
    #[arg(long = "cache-max-entries", default_value_t = -1, allow_hyphen_values = true)]
    pub cache_max_entries: i64,

    /// Maximum access count to cached entries, -1 = unlimited
    #[arg(long = "cache-max-access", default_value_t = -1, allow_hyphen_values = true)]
    pub cache_max_access: i64,

    // Debug and profiling
    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Serve live profiling information at this address
    #[arg(long = "profile-bind")]
    pub profile_bind: Option<String>,

    /// Write a CPU profile to this file on exit
    #[arg(long = "profile-cpu")]
    pub profile_cpu: Option<PathBuf>,

    /// Write a memory profile to this file once mounted
    #[arg(long = "profile-ram")]
    pub profile_ram: Option<PathBuf>,
}

/// Built-in defaults shared by the flag definitions and `Default`.
pub mod defaults {
    use std::time::Duration;

    pub const SEGMENT_SIZE_MIB: u64 = 256;
    pub const READAHEAD_SIZE_KIB: u32 = 128;
    pub const BLOCK_SIZE: u32 = 4096;
    pub const READDIR_CONCURRENCY: usize = 20;
    pub const MODE: u32 = 0o700;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    pub const CACHE_TTL: Duration = Duration::from_secs(60);
    pub const CACHE_UNLIMITED: i64 = -1;
}

impl Default for MountArgs {
    fn default() -> Self {
        Self {
            device: None,
            mountpoint: None,
            config: None,
            auth_url: None,
            container: None,
            auth_token: None,
            username: None,
            password: None,
            tenant: None,
            domain: None,
            region: None,
            storage_url: None,
            storage_policy: None,
            auth_version: 0,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            request_timeout: defaults::REQUEST_TIMEOUT,
            segment_size: defaults::SEGMENT_SIZE_MIB,
            hubic_authorization: None,
            hubic_refresh_token: None,
            uid: None,
            gid: None,
            mode: defaults::MODE,
            allow_root: false,
            allow_other: true,
            default_permissions: true,
            read_only: false,
            readdir_concurrency: defaults::READDIR_CONCURRENCY,
            fetch_attributes: false,
            fetch_extended_attributes: false,
            block_size: defaults::BLOCK_SIZE,
            readahead_size: defaults::READAHEAD_SIZE_KIB,
            cache_ttl: defaults::CACHE_TTL,
            cache_max_entries: defaults::CACHE_UNLIMITED,
            cache_max_access: defaults::CACHE_UNLIMITED,
            debug: false,
            profile_bind: None,
            profile_cpu: None,
            profile_ram: None,
        }
    }
}

fn parse_octal(value: &str) -> Result<u32, ParseIntError> {
    u32::from_str_radix(value.trim_start_matches("0o"), 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_mount_flags() {
        let cli = Cli::parse_from([
            "swiftmount",
            "mount",
            "--device",
            "volume",
            "--mountpoint",
            "/mnt/storage",
            "--os-username",
            "user",
            "--os-segment-size",
            "512",
            "--allow-other=false",
            "--read-only",
            "--cache-max-entries",
            "-1",
        ]);
        let Command::Mount(args) = cli.command;
        assert_eq!(args.device.as_deref(), Some("volume"));
        assert_eq!(args.mountpoint.as_deref(), Some("/mnt/storage".as_ref()));
        assert_eq!(args.username.as_deref(), Some("user"));
        assert_eq!(args.segment_size, 512);
        assert!(!args.allow_other);
        assert!(args.read_only);
        assert_eq!(args.cache_max_entries, -1);
    }

    #[test]
    fn defaults_match_flag_defaults() {
        let cli = Cli::parse_from(["swiftmount", "mount"]);
        let Command::Mount(parsed) = cli.command;
        let built = MountArgs::default();
        assert_eq!(parsed.segment_size, built.segment_size);
        assert_eq!(parsed.readahead_size, built.readahead_size);
        assert_eq!(parsed.mode, built.mode);
        assert_eq!(parsed.allow_other, built.allow_other);
        assert_eq!(parsed.default_permissions, built.default_permissions);
        assert_eq!(parsed.cache_ttl, built.cache_ttl);
        assert_eq!(parsed.connect_timeout, built.connect_timeout);
        assert_eq!(parsed.request_timeout, built.request_timeout);
    }

    #[test]
    fn octal_mode_parsing() {
        assert_eq!(parse_octal("0700").unwrap(), 0o700);
        assert_eq!(parse_octal("755").unwrap(), 0o755);
        assert!(parse_octal("9").is_err());
    }
}
