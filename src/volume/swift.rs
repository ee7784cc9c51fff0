//! Swift and hubiC volume driver
//!
//! Initialization performs the credential exchange for whichever
//! credential shape was configured and validates the account by listing
//! its containers. Dispatch then exposes the containers as the mount's
//! root directory; listings are refreshed through the metadata cache.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyDirectory, ReplyEntry, ReplyStatfs, Request,
};
use futures::stream::{self, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{Credentials, MountConfig};
use crate::volume::cache::ListingCache;
use crate::volume::{Volume, VolumeError};

const ROOT_INO: u64 = 1;
const FIRST_CONTAINER_INO: u64 = 2;

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const STORAGE_POLICY_HEADER: &str = "x-storage-policy";

const HUBIC_TOKEN_URL: &str = "https://api.hubic.com/oauth/token";
const HUBIC_CREDENTIALS_URL: &str = "https://api.hubic.com/1.0/account/credentials";

/// One container of the account, as returned by the account listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(skip)]
    pub policy: Option<String>,
}

/// Authenticated storage endpoint.
#[derive(Debug, Clone)]
struct StorageSession {
    storage_url: String,
    token: String,
}

/// Production volume driver for Swift-compatible object storage.
pub struct SwiftVolume {
    credentials: Credentials,
    auth_version: u32,
    container: Option<String>,
    storage_policy: Option<String>,
    uid: u32,
    gid: u32,
    mode: u32,
    block_size: u32,
    fetch_attributes: bool,
    fetch_extended_attributes: bool,
    readdir_concurrency: usize,
    attr_ttl: Duration,
    mount_time: SystemTime,
    cache: ListingCache<Vec<Container>>,
    runtime: Handle,
    client: reqwest::Client,
    session: Option<StorageSession>,
}

/// Account listings are cached under a single key.
const ACCOUNT_KEY: &str = "/";

impl SwiftVolume {
    pub fn new(
        config: &MountConfig,
        credentials: Credentials,
        runtime: Handle,
    ) -> Result<Self, VolumeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("swiftmount/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            credentials,
            auth_version: config.auth_version,
            container: config.container.clone(),
            storage_policy: config.storage_policy.clone(),
            uid: config.uid,
            gid: config.gid,
            mode: config.mode,
            block_size: config.block_size,
            fetch_attributes: config.fetch_attributes,
            fetch_extended_attributes: config.fetch_extended_attributes,
            readdir_concurrency: config.readdir_concurrency,
            attr_ttl: config.cache_ttl,
            mount_time: SystemTime::now(),
            cache: ListingCache::new(
                config.cache_ttl,
                config.cache_max_entries,
                config.cache_max_access,
            ),
            runtime,
            client,
            session: None,
        })
    }

    fn refresh_containers(&mut self) -> Result<Vec<Container>, VolumeError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| VolumeError::Auth("volume is not initialized".to_string()))?;
        let listing = self.runtime.block_on(list_containers(
            &self.client,
            session,
            self.storage_policy.as_deref(),
            self.fetch_extended_attributes,
            self.readdir_concurrency,
        ))?;
        self.cache.store(ACCOUNT_KEY.to_string(), listing.clone());
        Ok(listing)
    }

    /// Current container listing, served from cache while it lives.
    fn containers(&mut self) -> Result<Vec<Container>, VolumeError> {
        if let Some(listing) = self.cache.get(ACCOUNT_KEY) {
            return Ok(listing);
        }
        self.refresh_containers()
    }

    fn directory_attr(&self, ino: u64, size: u64) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(u64::from(self.block_size)),
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: FileType::Directory,
            perm: self.mode as u16,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: self.block_size,
            flags: 0,
        }
    }

    fn container_attr(&self, index: usize, container: &Container) -> FileAttr {
        let size = if self.fetch_attributes {
            container.bytes
        } else {
            0
        };
        self.directory_attr(container_ino(index), size)
    }
}

impl Volume for SwiftVolume {
    fn initialize(&mut self) -> Result<(), VolumeError> {
        let session = self.runtime.block_on(authenticate(
            &self.client,
            &self.credentials,
            self.auth_version,
        ))?;
        info!(endpoint = %session.storage_url, "authenticated against object storage");
        self.session = Some(session);

        let listing = self.refresh_containers()?;
        if let Some(target) = &self.container {
            if !listing.iter().any(|c| &c.name == target) {
                return Err(VolumeError::UnknownContainer(target.clone()));
            }
        }
        info!(containers = listing.len(), "container listing fetched");
        Ok(())
    }
}

impl Filesystem for SwiftVolume {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let containers = match self.containers() {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "listing refresh failed");
                reply.error(libc::EIO);
                return;
            }
        };
        match containers.iter().position(|c| c.name == name) {
            Some(index) => {
                let attr = self.container_attr(index, &containers[index]);
                reply.entry(&self.attr_ttl, &attr, GENERATION);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            let attr = self.directory_attr(ROOT_INO, 0);
            reply.attr(&self.attr_ttl, &attr);
            return;
        }
        let containers = match self.containers() {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "listing refresh failed");
                reply.error(libc::EIO);
                return;
            }
        };
        let found = container_index(ino).and_then(|index| {
            containers.get(index).map(|container| (index, container))
        });
        match found {
            Some((index, container)) => {
                let attr = self.container_attr(index, container);
                reply.attr(&self.attr_ttl, &attr);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let containers = match self.containers() {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "listing refresh failed");
                reply.error(libc::EIO);
                return;
            }
        };

        let entries: Vec<(u64, String)> = if ino == ROOT_INO {
            let mut entries = vec![(ROOT_INO, ".".to_string()), (ROOT_INO, "..".to_string())];
            entries.extend(
                containers
                    .iter()
                    .enumerate()
                    .map(|(index, container)| (container_ino(index), container.name.clone())),
            );
            entries
        } else if container_index(ino).is_some_and(|index| index < containers.len()) {
            vec![(ino, ".".to_string()), (ROOT_INO, "..".to_string())]
        } else {
            reply.error(libc::ENOENT);
            return;
        };

        for (position, (entry_ino, name)) in entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (position + 1) as i64, FileType::Directory, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, self.block_size, 255, self.block_size);
    }
}

fn container_ino(index: usize) -> u64 {
    index as u64 + FIRST_CONTAINER_INO
}

fn container_index(ino: u64) -> Option<usize> {
    ino.checked_sub(FIRST_CONTAINER_INO).map(|index| index as usize)
}

// =============================================================================
// Credential exchange
// =============================================================================

async fn authenticate(
    client: &reqwest::Client,
    credentials: &Credentials,
    auth_version: u32,
) -> Result<StorageSession, VolumeError> {
    match credentials {
        Credentials::Token { storage_url, token } => Ok(StorageSession {
            storage_url: storage_url.clone(),
            token: token.clone(),
        }),
        Credentials::Keystone {
            auth_url,
            username,
            password,
            tenant,
            domain,
            region,
        } => match pick_auth_version(auth_version, domain.as_deref()) {
            3 => {
                keystone_v3_auth(
                    client,
                    auth_url,
                    username,
                    password,
                    domain.as_deref(),
                    tenant.as_deref(),
                    region.as_deref(),
                )
                .await
            }
            _ => {
                keystone_v2_auth(
                    client,
                    auth_url,
                    username,
                    password,
                    tenant.as_deref(),
                    region.as_deref(),
                )
                .await
            }
        },
        Credentials::Hubic {
            authorization,
            refresh_token,
        } => hubic_auth(client, authorization, refresh_token).await,
    }
}

/// Version 0 selects automatically: v3 when a domain is configured,
/// v2 otherwise.
fn pick_auth_version(requested: u32, domain: Option<&str>) -> u32 {
    match requested {
        0 if domain.is_some() => 3,
        0 => 2,
        explicit => explicit,
    }
}

async fn keystone_v2_auth(
    client: &reqwest::Client,
    auth_url: &str,
    username: &str,
    password: &str,
    tenant: Option<&str>,
    region: Option<&str>,
) -> Result<StorageSession, VolumeError> {
    let url = format!("{}/tokens", auth_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&keystone_v2_body(username, password, tenant))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(VolumeError::Auth(format!(
            "keystone v2 returned {}",
            response.status()
        )));
    }
    let document: serde_json::Value = response.json().await?;
    let token = document["access"]["token"]["id"]
        .as_str()
        .ok_or_else(|| VolumeError::Auth("keystone v2 response carries no token".to_string()))?
        .to_string();
    let storage_url = v2_object_store_endpoint(&document, region).ok_or_else(|| {
        VolumeError::Auth("no object-store endpoint in the service catalog".to_string())
    })?;
    Ok(StorageSession { storage_url, token })
}

fn keystone_v2_body(username: &str, password: &str, tenant: Option<&str>) -> serde_json::Value {
    let mut auth = serde_json::json!({
        "passwordCredentials": { "username": username, "password": password }
    });
    if let Some(tenant) = tenant {
        auth["tenantName"] = serde_json::json!(tenant);
    }
    serde_json::json!({ "auth": auth })
}

fn v2_object_store_endpoint(document: &serde_json::Value, region: Option<&str>) -> Option<String> {
    let services = document["access"]["serviceCatalog"].as_array()?;
    let service = services.iter().find(|s| s["type"] == "object-store")?;
    let endpoints = service["endpoints"].as_array()?;
    let endpoint = match region {
        Some(region) => endpoints.iter().find(|e| e["region"] == region)?,
        None => endpoints.first()?,
    };
    endpoint["publicURL"].as_str().map(str::to_string)
}

async fn keystone_v3_auth(
    client: &reqwest::Client,
    auth_url: &str,
    username: &str,
    password: &str,
    domain: Option<&str>,
    tenant: Option<&str>,
    region: Option<&str>,
) -> Result<StorageSession, VolumeError> {
    let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&keystone_v3_body(username, password, domain, tenant))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(VolumeError::Auth(format!(
            "keystone v3 returned {}",
            response.status()
        )));
    }
    let token = response
        .headers()
        .get("x-subject-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| VolumeError::Auth("keystone v3 issued no subject token".to_string()))?;
    let document: serde_json::Value = response.json().await?;
    let storage_url = v3_object_store_endpoint(&document, region).ok_or_else(|| {
        VolumeError::Auth("no object-store endpoint in the service catalog".to_string())
    })?;
    Ok(StorageSession { storage_url, token })
}

fn keystone_v3_body(
    username: &str,
    password: &str,
    domain: Option<&str>,
    tenant: Option<&str>,
) -> serde_json::Value {
    let domain = domain.unwrap_or("Default");
    let mut body = serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": username,
                        "domain": { "name": domain },
                        "password": password
                    }
                }
            }
        }
    });
    if let Some(tenant) = tenant {
        body["auth"]["scope"] =
            serde_json::json!({ "project": { "name": tenant, "domain": { "name": domain } } });
    }
    body
}

fn v3_object_store_endpoint(document: &serde_json::Value, region: Option<&str>) -> Option<String> {
    let services = document["token"]["catalog"].as_array()?;
    let service = services.iter().find(|s| s["type"] == "object-store")?;
    let endpoints = service["endpoints"].as_array()?;
    let endpoint = endpoints.iter().find(|e| {
        e["interface"] == "public" && region.map_or(true, |region| e["region"] == region)
    })?;
    endpoint["url"].as_str().map(str::to_string)
}

/// Exchange the stored refresh token for Swift credentials through the
/// hubiC OAuth endpoints.
async fn hubic_auth(
    client: &reqwest::Client,
    authorization: &str,
    refresh_token: &str,
) -> Result<StorageSession, VolumeError> {
    let response = client
        .post(HUBIC_TOKEN_URL)
        .header(AUTHORIZATION, format!("Basic {authorization}"))
        .form(&[
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(VolumeError::Auth(format!(
            "hubiC token refresh returned {}",
            response.status()
        )));
    }
    let grant: serde_json::Value = response.json().await?;
    let access_token = grant["access_token"]
        .as_str()
        .ok_or_else(|| VolumeError::Auth("hubiC grant carries no access token".to_string()))?;

    let response = client
        .get(HUBIC_CREDENTIALS_URL)
        .bearer_auth(access_token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(VolumeError::Auth(format!(
            "hubiC credentials endpoint returned {}",
            response.status()
        )));
    }
    let credentials: serde_json::Value = response.json().await?;
    let token = credentials["token"]
        .as_str()
        .ok_or_else(|| VolumeError::Auth("hubiC credentials carry no token".to_string()))?
        .to_string();
    let storage_url = credentials["endpoint"]
        .as_str()
        .ok_or_else(|| VolumeError::Auth("hubiC credentials carry no endpoint".to_string()))?
        .to_string();
    Ok(StorageSession { storage_url, token })
}

// =============================================================================
// Account listing
// =============================================================================

async fn list_containers(
    client: &reqwest::Client,
    session: &StorageSession,
    policy: Option<&str>,
    fetch_meta: bool,
    concurrency: usize,
) -> Result<Vec<Container>, VolumeError> {
    let url = format!("{}?format=json", session.storage_url);
    let response = client
        .get(&url)
        .header(AUTH_TOKEN_HEADER, &session.token)
        .send()
        .await?;
    match response.status() {
        StatusCode::UNAUTHORIZED => {
            return Err(VolumeError::Auth(
                "storage token rejected by the account endpoint".to_string(),
            ))
        }
        status if !status.is_success() => {
            return Err(VolumeError::Auth(format!(
                "account listing returned {status}"
            )))
        }
        _ => {}
    }
    let mut containers: Vec<Container> = response.json().await?;

    // Per-container metadata comes from HEAD requests, bounded by the
    // configured listing concurrency.
    if policy.is_some() || fetch_meta {
        let policies: Vec<Option<String>> =
            stream::iter(containers.iter().map(|c| c.name.clone()))
                .map(|name| {
                    let client = client.clone();
                    let session = session.clone();
                    async move { container_policy(&client, &session, &name).await }
                })
                .buffered(concurrency.max(1))
                .collect()
                .await;
        for (container, policy_header) in containers.iter_mut().zip(policies) {
            container.policy = policy_header;
        }
        if let Some(wanted) = policy {
            containers.retain(|c| c.policy.as_deref() == Some(wanted));
        }
    }

    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(containers)
}

async fn container_policy(
    client: &reqwest::Client,
    session: &StorageSession,
    name: &str,
) -> Option<String> {
    let url = format!("{}/{}", session.storage_url, name);
    let response = client
        .head(&url)
        .header(AUTH_TOKEN_HEADER, &session.token)
        .send()
        .await
        .ok()?;
    response
        .headers()
        .get(STORAGE_POLICY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_version_depends_on_domain() {
        assert_eq!(pick_auth_version(0, None), 2);
        assert_eq!(pick_auth_version(0, Some("Default")), 3);
        assert_eq!(pick_auth_version(2, Some("Default")), 2);
        assert_eq!(pick_auth_version(3, None), 3);
    }

    #[test]
    fn v2_body_includes_tenant_only_when_set() {
        let body = keystone_v2_body("user", "secret", Some("tenant"));
        assert_eq!(body["auth"]["passwordCredentials"]["username"], "user");
        assert_eq!(body["auth"]["tenantName"], "tenant");

        let body = keystone_v2_body("user", "secret", None);
        assert!(body["auth"].get("tenantName").is_none());
    }

    #[test]
    fn v3_body_scopes_to_project_when_tenant_set() {
        let body = keystone_v3_body("user", "secret", Some("corp"), Some("tenant"));
        assert_eq!(
            body["auth"]["identity"]["password"]["user"]["domain"]["name"],
            "corp"
        );
        assert_eq!(body["auth"]["scope"]["project"]["name"], "tenant");

        let body = keystone_v3_body("user", "secret", None, None);
        assert_eq!(
            body["auth"]["identity"]["password"]["user"]["domain"]["name"],
            "Default"
        );
        assert!(body["auth"].get("scope").is_none());
    }

    #[test]
    fn v2_endpoint_selection_honors_region() {
        let document = serde_json::json!({
            "access": {
                "serviceCatalog": [
                    { "type": "compute", "endpoints": [] },
                    {
                        "type": "object-store",
                        "endpoints": [
                            { "region": "GRA", "publicURL": "https://storage.gra/v1/acct" },
                            { "region": "BHS", "publicURL": "https://storage.bhs/v1/acct" }
                        ]
                    }
                ]
            }
        });
        assert_eq!(
            v2_object_store_endpoint(&document, Some("BHS")).as_deref(),
            Some("https://storage.bhs/v1/acct")
        );
        assert_eq!(
            v2_object_store_endpoint(&document, None).as_deref(),
            Some("https://storage.gra/v1/acct")
        );
        assert_eq!(v2_object_store_endpoint(&document, Some("SBG")), None);
    }

    #[test]
    fn v3_endpoint_selection_requires_public_interface() {
        let document = serde_json::json!({
            "token": {
                "catalog": [
                    {
                        "type": "object-store",
                        "endpoints": [
                            { "interface": "internal", "region": "GRA", "url": "https://internal" },
                            { "interface": "public", "region": "GRA", "url": "https://public.gra" }
                        ]
                    }
                ]
            }
        });
        assert_eq!(
            v3_object_store_endpoint(&document, Some("GRA")).as_deref(),
            Some("https://public.gra")
        );
        assert_eq!(
            v3_object_store_endpoint(&document, None).as_deref(),
            Some("https://public.gra")
        );
        assert_eq!(v3_object_store_endpoint(&document, Some("BHS")), None);
    }

    #[test]
    fn container_listing_deserializes() {
        let listing = r#"[
            { "name": "documents", "count": 12, "bytes": 4096 },
            { "name": "backups", "count": 0, "bytes": 0 }
        ]"#;
        let containers: Vec<Container> = serde_json::from_str(listing).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "documents");
        assert_eq!(containers[0].bytes, 4096);
        assert_eq!(containers[1].policy, None);
    }

    #[test]
    fn inode_mapping_roundtrips() {
        assert_eq!(container_ino(0), FIRST_CONTAINER_INO);
        assert_eq!(container_index(container_ino(7)), Some(7));
        assert_eq!(container_index(ROOT_INO), None);
    }
}
