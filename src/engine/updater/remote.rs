//! Remote update info
//!
//! Fetches the server's view of the current content version and the patch
//! resources that lead to it, then decides whether the local install needs
//! an update.

use super::verify::PublishedDigest;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InfoError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned HTTP {0}")]
    Status(u16),

    #[error("Malformed update info: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Version triple reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentVersions {
    #[serde(default, deserialize_with = "string_or_number")]
    pub coreversion: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub cppversion: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub resversion: String,
}

/// One downloadable patch archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub file: String,
    #[serde(default)]
    pub md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, deserialize_with = "optional_u64")]
    pub size: Option<u64>,
}

impl ResourceDescriptor {
    /// Digest to verify against. SHA-256 wins when both are published.
    pub fn digest(&self) -> Option<PublishedDigest> {
        match &self.sha256 {
            Some(sha) if !sha.trim().is_empty() => Some(PublishedDigest::sha256(sha.trim())),
            _ if !self.md5.trim().is_empty() => Some(PublishedDigest::md5(self.md5.trim())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    #[serde(default)]
    pub state: i64,
    /// Unix timestamp (seconds) of the window end, `0` when open-ended
    #[serde(default)]
    pub end: i64,
}

impl MaintenanceWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state != 0 && (self.end <= 0 || self.end > now.timestamp())
    }
}

/// Parsed response of the info endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUpdateInfo {
    #[serde(default)]
    pub current: CurrentVersions,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub updateurl: String,
    #[serde(default, deserialize_with = "optional_u64")]
    pub apk_version: Option<u64>,
    #[serde(default)]
    pub maintain: Option<MaintenanceWindow>,
    #[serde(default)]
    pub isinreview: i64,
}

impl RemoteUpdateInfo {
    pub fn parse(body: &str) -> Result<Self, InfoError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Remote content version, `None` when blank or not an integer
    pub fn remote_version(&self) -> Option<u64> {
        self.current.resversion.trim().parse().ok()
    }

    /// Full URL of a resource: `<host><file>`
    pub fn resource_url(&self, resource: &ResourceDescriptor) -> String {
        format!("{}{}", self.host, resource.file)
    }
}

/// Outcome of comparing local and remote versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    UpToDate,
    Required {
        from: u64,
        to: u64,
        resource: ResourceDescriptor,
    },
    /// No usable remote info; keep running on local content
    Unavailable,
    Maintenance,
}

/// Update is required iff the remote version is strictly greater than the
/// local one and a resource is published for it.
pub fn decide(local: u64, remote: Option<&RemoteUpdateInfo>, now: DateTime<Utc>) -> UpdateDecision {
    let Some(info) = remote else {
        return UpdateDecision::Unavailable;
    };
    if info.maintain.as_ref().is_some_and(|m| m.is_active(now)) {
        return UpdateDecision::Maintenance;
    }
    let Some(to) = info.remote_version() else {
        return UpdateDecision::Unavailable;
    };
    if to <= local {
        return UpdateDecision::UpToDate;
    }
    match info.resources.first() {
        Some(resource) => UpdateDecision::Required {
            from: local,
            to,
            resource: resource.clone(),
        },
        None => UpdateDecision::Unavailable,
    }
}

/// Build identity sent with every info request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdentity {
    pub game: String,
    pub core_version: String,
    pub cpp_version: String,
    pub client_version: String,
    pub channel_code: String,
    pub device_id: String,
}

/// Client for the update info endpoint
#[derive(Clone)]
pub struct VersionResolver {
    client: reqwest::Client,
    url: String,
    identity: BuildIdentity,
}

impl VersionResolver {
    pub fn new(
        url: impl Into<String>,
        identity: BuildIdentity,
        timeout: Duration,
        system_proxy: bool,
    ) -> Result<Self, InfoError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !system_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            client: builder.build()?,
            url: url.into(),
            identity,
        })
    }

    pub fn identity(&self) -> &BuildIdentity {
        &self.identity
    }

    fn query(&self, local_version: &str) -> Vec<(&'static str, String)> {
        vec![
            ("game", self.identity.game.clone()),
            ("coreversion", self.identity.core_version.clone()),
            ("cppversion", self.identity.cpp_version.clone()),
            ("resversion", local_version.to_string()),
            ("client_version", self.identity.client_version.clone()),
            ("device_id", self.identity.device_id.clone()),
            ("channel_code", self.identity.channel_code.clone()),
        ]
    }

    /// Fetch remote info. Timeouts surface as `InfoError::Network`.
    pub async fn fetch(&self, local_version: &str) -> Result<RemoteUpdateInfo, InfoError> {
        let response = self
            .client
            .get(&self.url)
            .query(&self.query(local_version))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(InfoError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        let info = RemoteUpdateInfo::parse(&body)?;
        debug!(resversion = %info.current.resversion, resources = info.resources.len(), "update info received");
        Ok(info)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
        Null,
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Null => String::new(),
    })
}

fn optional_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = string_or_number(deserializer)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| de::Error::custom(format!("expected an unsigned integer, got {trimmed:?}")))
}
