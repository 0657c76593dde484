use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HandoffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportScheme {
    /// Capture the VM residue into a local image; no live destination.
    File,
    Http,
    Https,
    /// Already-resolved stream target (`tcp://host:port`).
    Tcp,
}

impl TransportScheme {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "file" => Some(TransportScheme::File),
            "http" => Some(TransportScheme::Http),
            "https" => Some(TransportScheme::Https),
            "tcp" => Some(TransportScheme::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::File => "file",
            TransportScheme::Http => "http",
            TransportScheme::Https => "https",
            TransportScheme::Tcp => "tcp",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, TransportScheme::Http | TransportScheme::Https)
    }
}

/// A parsed `destination_url`.
///
/// For `file` the first path segment is the authority, so `file:///my-residue` and
/// `file://my-residue` both name the residue `my-residue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationUrl {
    raw: String,
    scheme: TransportScheme,
    authority: String,
    path: String,
}

impl DestinationUrl {
    pub fn parse(raw: &str) -> Result<Self, HandoffError> {
        let trimmed = raw.trim();
        let Some((scheme_part, rest)) = trimmed.split_once("://") else {
            return Err(HandoffError::Validation(format!(
                "Invalid handoff_url ({}). Need <scheme>://<destination>",
                raw
            )));
        };
        let Some(scheme) = TransportScheme::parse(scheme_part) else {
            return Err(HandoffError::Validation(format!(
                "Invalid handoff_url ({}). Only support file, http, https and tcp scheme.",
                raw
            )));
        };

        let rest = if scheme == TransportScheme::File {
            rest.trim_start_matches('/')
        } else {
            rest
        };
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = rest[..end].to_string();
        let path = rest[end..].to_string();

        if authority.is_empty() {
            return Err(HandoffError::Validation(format!(
                "Invalid handoff_url ({}). Need destination (e.g. handoff destination address)",
                raw
            )));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            scheme,
            authority,
            path,
        })
    }

    pub fn scheme(&self) -> TransportScheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `scheme://authority/path` without a trailing slash, the prefix for API requests.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority,
            self.path.trim_end_matches('/')
        )
    }

    /// Split a `host:port` authority. Bracketed IPv6 hosts are unwrapped.
    pub fn host_port(&self) -> Option<(String, u16)> {
        let (host, port) = self.authority.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }
}

impl fmt::Display for DestinationUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Inbound `perform_handoff` call, as received from the controller layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub source_instance_id: String,
    pub destination_url: Option<String>,
    pub destination_auth_token: Option<String>,
    pub destination_vm_name: Option<String>,
}

/// Where the VM state goes, decided purely from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffTarget {
    LocalExport { residue_name: String },
    Remote { endpoint: DestinationUrl, token: String },
    Stream { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct ValidatedHandoff {
    pub source_instance_id: String,
    pub destination: DestinationUrl,
    pub target: HandoffTarget,
    pub destination_vm_name: Option<String>,
}

impl HandoffRequest {
    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<ValidatedHandoff, HandoffError> {
        if self.source_instance_id.trim().is_empty() {
            return Err(HandoffError::Validation("Need source instance id".to_string()));
        }
        let raw = self
            .destination_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandoffError::Validation("Need Handoff URL".to_string()))?;
        let destination = DestinationUrl::parse(raw)?;

        let target = match destination.scheme() {
            TransportScheme::File => HandoffTarget::LocalExport {
                residue_name: destination.authority().to_string(),
            },
            TransportScheme::Http | TransportScheme::Https => {
                let token = self
                    .destination_auth_token
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HandoffError::Validation(
                            "Need auth-token for the handoff destination".to_string(),
                        )
                    })?;
                HandoffTarget::Remote {
                    endpoint: destination.clone(),
                    token: token.to_string(),
                }
            }
            TransportScheme::Tcp => {
                let (host, port) = destination.host_port().ok_or_else(|| {
                    HandoffError::Validation(format!(
                        "Invalid handoff_url ({}). tcp destination must be host:port",
                        raw
                    ))
                })?;
                HandoffTarget::Stream { host, port }
            }
        };

        let destination_vm_name = self
            .destination_vm_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(ValidatedHandoff {
            source_instance_id: self.source_instance_id.trim().to_string(),
            destination,
            target,
            destination_vm_name,
        })
    }
}
