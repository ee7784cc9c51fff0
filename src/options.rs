//! Mount option building
//!
//! Maps a normalized [`MountConfig`] to the discrete set of OS-level
//! mount feature flags. The mapping is pure and the resulting order is
//! stable; conversion to the FUSE library's own option type happens
//! inside the gateway.

use crate::config::MountConfig;

/// Filesystem subtype reported to the kernel for every mount.
pub const FS_SUBTYPE: &str = "swiftmount";

/// One OS-level mount feature flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountFlag {
    AllowOther,
    AllowRoot,
    DefaultPermissions,
    ReadOnly,
    /// Maximum per-file readahead, bytes.
    MaxReadahead(u32),
    Subtype(&'static str),
    /// Display name shown for the mounted device.
    Name(String),
}

/// Immutable flag list computed once per mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    flags: Vec<MountFlag>,
}

impl MountOptions {
    pub fn flags(&self) -> &[MountFlag] {
        &self.flags
    }

    pub fn contains(&self, flag: &MountFlag) -> bool {
        self.flags.contains(flag)
    }
}

/// Build the mount options for a normalized configuration. Boolean flags
/// are included only when enabled; readahead, subtype and display name
/// are always present.
pub fn mount_options(config: &MountConfig) -> MountOptions {
    let mut flags = Vec::new();

    if config.allow_other {
        flags.push(MountFlag::AllowOther);
    }
    if config.allow_root {
        flags.push(MountFlag::AllowRoot);
    }
    if config.default_permissions {
        flags.push(MountFlag::DefaultPermissions);
    }
    if config.read_only {
        flags.push(MountFlag::ReadOnly);
    }

    flags.push(MountFlag::MaxReadahead(config.readahead_size));
    flags.push(MountFlag::Subtype(FS_SUBTYPE));
    flags.push(MountFlag::Name(config.device.clone()));

    MountOptions { flags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::MountArgs;
    use crate::env::EnvOverlay;
    use std::path::PathBuf;

    fn config() -> MountConfig {
        let args = MountArgs {
            device: Some("volume".to_string()),
            mountpoint: Some(PathBuf::from("/mnt/storage")),
            ..MountArgs::default()
        };
        MountConfig::resolve(&args, None, &EnvOverlay::default())
            .unwrap()
            .normalized()
            .unwrap()
    }

    #[test]
    fn boolean_flags_included_only_when_set() {
        let mut config = config();
        config.allow_other = true;
        config.allow_root = false;
        config.read_only = true;

        let options = mount_options(&config);
        assert!(options.contains(&MountFlag::AllowOther));
        assert!(options.contains(&MountFlag::ReadOnly));
        assert!(!options.contains(&MountFlag::AllowRoot));
    }

    #[test]
    fn device_maps_to_subtype_and_name() {
        let options = mount_options(&config());
        assert!(options.contains(&MountFlag::Subtype(FS_SUBTYPE)));
        assert!(options.contains(&MountFlag::Name("volume".to_string())));
    }

    #[test]
    fn readahead_carries_normalized_bytes() {
        let options = mount_options(&config());
        assert!(options.contains(&MountFlag::MaxReadahead(128 * 1024)));
    }

    #[test]
    fn flag_order_is_stable() {
        let mut config = config();
        config.allow_other = true;
        config.allow_root = true;
        config.read_only = true;

        let first = mount_options(&config);
        let second = mount_options(&config);
        assert_eq!(first, second);
        assert_eq!(
            first.flags()[..4],
            [
                MountFlag::AllowOther,
                MountFlag::AllowRoot,
                MountFlag::DefaultPermissions,
                MountFlag::ReadOnly,
            ]
        );
    }
}
