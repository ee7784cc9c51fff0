//! Configuration resolution and normalization
//!
//! A `MountConfig` is assembled once per invocation from four layers with
//! per-field precedence: command-line flag, config-file key, environment
//! variable, built-in default. A field absent in one layer falls through
//! to the next independently of the other fields.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::MountArgs;
use crate::env::EnvOverlay;
use crate::error::MountError;

/// Built-in authentication endpoint, used when no layer provides one.
pub const DEFAULT_AUTH_URL: &str = "https://auth.cloud.ovh.net/v2.0";

/// Segments must stay below the backing store's single-object limit.
pub const MAX_SEGMENT_BYTES: u64 = 5 << 30;

// =============================================================================
// Config file layer
// =============================================================================

/// Keys readable from the YAML config file. All optional; anything unset
/// falls through to the environment layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub os_auth_url: Option<String>,
    pub os_username: Option<String>,
    pub os_password: Option<String>,
    pub os_tenant_name: Option<String>,
    pub os_domain_name: Option<String>,
    pub os_region_name: Option<String>,
    pub os_auth_token: Option<String>,
    pub os_storage_url: Option<String>,
    pub hubic_authorization: Option<String>,
    pub hubic_refresh_token: Option<String>,
}

impl ConfigFile {
    /// Default location: `~/.swiftmount.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".swiftmount.yaml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigFileError::Read(path.to_path_buf(), source))?;
        serde_yaml::from_str(&content)
            .map_err(|source| ConfigFileError::Parse(path.to_path_buf(), source))
    }
}

/// A config file that cannot be used. Never fatal: resolution degrades to
/// the remaining layers and the failure is logged.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("cannot read {0:?}: {1}")]
    Read(PathBuf, #[source] io::Error),

    #[error("cannot parse {0:?}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

impl ConfigFileError {
    /// An absent file at the default location is routine, not noteworthy.
    pub fn is_absent(&self) -> bool {
        matches!(self, ConfigFileError::Read(_, source) if source.kind() == io::ErrorKind::NotFound)
    }
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Fully-merged mount configuration. Built once by [`MountConfig::resolve`]
/// and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub device: String,
    pub mountpoint: PathBuf,

    // Connection
    pub auth_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant: Option<String>,
    pub domain: Option<String>,
    pub region: Option<String>,
    pub auth_token: Option<String>,
    pub storage_url: Option<String>,
    pub hubic_authorization: Option<String>,
    pub hubic_refresh_token: Option<String>,
    pub container: Option<String>,
    pub storage_policy: Option<String>,
    pub auth_version: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,

    // Permissions
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub allow_root: bool,
    pub allow_other: bool,
    pub default_permissions: bool,
    pub read_only: bool,

    // Prefetch and listing
    pub readdir_concurrency: usize,
    pub fetch_attributes: bool,
    pub fetch_extended_attributes: bool,
    pub block_size: u32,

    // Sizes. Segment size is MiB and readahead KiB until
    // [`MountConfig::normalized`] converts them to bytes.
    pub segment_size: u64,
    pub readahead_size: u32,

    // Cache policy, -1 sentinels mean unlimited
    pub cache_ttl: Duration,
    pub cache_max_entries: i64,
    pub cache_max_access: i64,

    // Diagnostics
    pub debug: bool,
    pub profile_bind: Option<String>,
    pub profile_cpu: Option<PathBuf>,
    pub profile_ram: Option<PathBuf>,
}

/// The credential shape the volume driver will authenticate with.
/// Exactly one must be configured; this is validated, never defaulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Keystone {
        auth_url: String,
        username: String,
        password: String,
        tenant: Option<String>,
        domain: Option<String>,
        region: Option<String>,
    },
    Token {
        storage_url: String,
        token: String,
    },
    Hubic {
        authorization: String,
        refresh_token: String,
    },
}

impl MountConfig {
    /// Merge the four configuration layers into one record.
    ///
    /// Only the device name and mountpoint are validated here; credential
    /// coherence is checked by [`MountConfig::credentials`] before the
    /// mount sequence starts.
    pub fn resolve(
        args: &MountArgs,
        file: Option<&ConfigFile>,
        env: &EnvOverlay,
    ) -> Result<Self, MountError> {
        let device = args
            .device
            .as_ref()
            .filter(|d| !d.is_empty())
            .cloned()
            .ok_or(MountError::MissingOption("device"))?;
        let mountpoint = args
            .mountpoint
            .as_ref()
            .filter(|m| !m.as_os_str().is_empty())
            .cloned()
            .ok_or(MountError::MissingOption("mountpoint"))?;

        let file = file.cloned().unwrap_or_default();

        Ok(Self {
            device,
            mountpoint,
            auth_url: pick(&args.auth_url, &file.os_auth_url, &env.auth_url)
                .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            username: pick(&args.username, &file.os_username, &env.username),
            password: pick(&args.password, &file.os_password, &env.password),
            tenant: pick(&args.tenant, &file.os_tenant_name, &env.tenant),
            domain: pick(&args.domain, &file.os_domain_name, &env.domain),
            region: pick(&args.region, &file.os_region_name, &env.region),
            auth_token: pick(&args.auth_token, &file.os_auth_token, &env.auth_token),
            storage_url: pick(&args.storage_url, &file.os_storage_url, &env.storage_url),
            hubic_authorization: pick(
                &args.hubic_authorization,
                &file.hubic_authorization,
                &env.hubic_authorization,
            ),
            hubic_refresh_token: pick(
                &args.hubic_refresh_token,
                &file.hubic_refresh_token,
                &env.hubic_refresh_token,
            ),
            container: set(&args.container),
            storage_policy: set(&args.storage_policy),
            auth_version: args.auth_version,
            connect_timeout: args.connect_timeout,
            request_timeout: args.request_timeout,
            uid: args.uid.unwrap_or_else(|| unsafe { libc::getuid() }),
            gid: args.gid.unwrap_or_else(|| unsafe { libc::getgid() }),
            mode: args.mode,
            allow_root: args.allow_root,
            allow_other: args.allow_other,
            default_permissions: args.default_permissions,
            read_only: args.read_only,
            readdir_concurrency: args.readdir_concurrency,
            fetch_attributes: args.fetch_attributes,
            fetch_extended_attributes: args.fetch_extended_attributes,
            block_size: args.block_size,
            segment_size: args.segment_size,
            readahead_size: args.readahead_size,
            cache_ttl: args.cache_ttl,
            cache_max_entries: args.cache_max_entries,
            cache_max_access: args.cache_max_access,
            debug: args.debug,
            profile_bind: set(&args.profile_bind),
            profile_cpu: args.profile_cpu.clone(),
            profile_ram: args.profile_ram.clone(),
        })
    }

    /// Convert human-friendly units to bytes: segment size MiB to bytes,
    /// readahead KiB to bytes. Consumes the config so the conversion can
    /// only happen once.
    pub fn normalized(mut self) -> Result<Self, MountError> {
        self.segment_size <<= 20;
        self.readahead_size = self.readahead_size.saturating_mul(1 << 10);

        if self.segment_size > MAX_SEGMENT_BYTES {
            return Err(MountError::InvalidOption(format!(
                "segment size {} MiB exceeds the 5 GiB object limit",
                self.segment_size >> 20
            )));
        }
        Ok(self)
    }

    /// Derive the credential variant from the merged record.
    pub fn credentials(&self) -> Result<Credentials, MountError> {
        let keystone = self.username.is_some() && self.password.is_some();
        let token = self.auth_token.is_some() && self.storage_url.is_some();
        let hubic = self.hubic_authorization.is_some() && self.hubic_refresh_token.is_some();

        match (keystone, token, hubic) {
            (true, false, false) => Ok(Credentials::Keystone {
                auth_url: self.auth_url.clone(),
                username: self.username.clone().unwrap_or_default(),
                password: self.password.clone().unwrap_or_default(),
                tenant: self.tenant.clone(),
                domain: self.domain.clone(),
                region: self.region.clone(),
            }),
            (false, true, false) => Ok(Credentials::Token {
                storage_url: self.storage_url.clone().unwrap_or_default(),
                token: self.auth_token.clone().unwrap_or_default(),
            }),
            (false, false, true) => Ok(Credentials::Hubic {
                authorization: self.hubic_authorization.clone().unwrap_or_default(),
                refresh_token: self.hubic_refresh_token.clone().unwrap_or_default(),
            }),
            (false, false, false) => Err(MountError::InvalidOption(
                "no credentials configured; provide a username and password, \
                 an auth token and storage URL, or hubiC tokens"
                    .to_string(),
            )),
            _ => Err(MountError::InvalidOption(
                "more than one credential source configured; \
                 pick one of password, token or hubiC authentication"
                    .to_string(),
            )),
        }
    }
}

/// Highest-precedence set value wins; empty strings count as unset in
/// every layer.
fn pick(cli: &Option<String>, file: &Option<String>, env: &Option<String>) -> Option<String> {
    set(cli).or_else(|| set(file)).or_else(|| set(env))
}

fn set(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}
