//! Destination address resolution.
//!
//! A destination is built by appending `{prefix}/{segment}` to a base
//! address, where the segment is derived from the message type. With
//! several remote base addresses a strategy picks one per resolution:
//! [`RoundRobinResolver`] rotates through them per message type,
//! [`FailoverResolver`] sticks to the first one still available.
//! [`LocalAddressResolver`] serves the bus's own endpoints and never takes
//! part in rotation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::transport::{address_key, Result, TransportError};

/// Default path prefix for request destinations.
pub const DEFAULT_REQUEST_PATH_PREFIX: &str = "requests";

/// Maps a message type to a destination path segment.
pub type PathFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// URL-safe path segment for a message type.
///
/// Letters, digits, `-` and `_` are kept; everything else (namespace
/// separators included) becomes `-`. Leading and trailing dashes are
/// trimmed.
pub fn default_path_segment(message_type: &str) -> String {
    message_type
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_REQUEST_PATH_PREFIX.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builds `{base}/{prefix}/{segment}` destinations from one base address.
#[derive(Clone)]
pub struct RequestAddressBuilder {
    base: Url,
    prefix: String,
    formatter: PathFormatter,
}

impl RequestAddressBuilder {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            prefix: DEFAULT_REQUEST_PATH_PREFIX.to_string(),
            formatter: Arc::new(default_path_segment),
        }
    }

    /// Empty or slash-only prefixes fall back to `requests`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = normalize_prefix(prefix);
        self
    }

    pub fn with_formatter(mut self, formatter: PathFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Destination for `message_type`, or `None` when the formatter yields
    /// an empty segment.
    pub fn build(&self, message_type: &str) -> Option<Url> {
        let segment = (self.formatter)(message_type);
        if segment.trim().is_empty() {
            return None;
        }
        let mut address = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        address.set_path(&format!("{base_path}/{}/{segment}", self.prefix));
        Some(address)
    }
}

impl fmt::Debug for RequestAddressBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAddressBuilder")
            .field("base", &self.base.as_str())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Turns a message type into a destination address.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, message_type: &str) -> Option<Url>;

    /// Report that the host behind `address` is unreachable. Strategies
    /// without failover ignore this.
    fn mark_unavailable(&self, _address: &Url) {}

    /// Report that the host behind `address` is reachable again.
    fn mark_available(&self, _address: &Url) {}
}

// ============================================================================
// Strategies
// ============================================================================

/// Resolves against the bus's own base address.
#[derive(Debug, Clone)]
pub struct LocalAddressResolver {
    builder: RequestAddressBuilder,
}

impl LocalAddressResolver {
    pub fn new(builder: RequestAddressBuilder) -> Self {
        Self { builder }
    }
}

impl AddressResolver for LocalAddressResolver {
    fn resolve(&self, message_type: &str) -> Option<Url> {
        self.builder.build(message_type)
    }
}

/// Cycles through base addresses, independently per message type.
pub struct RoundRobinResolver {
    builders: Vec<RequestAddressBuilder>,
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinResolver {
    pub fn new(builders: Vec<RequestAddressBuilder>) -> Result<Self> {
        if builders.is_empty() {
            return Err(TransportError::Configuration(
                "round-robin resolution needs at least one address".to_string(),
            ));
        }
        Ok(Self {
            builders,
            counters: Mutex::new(HashMap::new()),
        })
    }

    fn next_index(&self, message_type: &str) -> usize {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = counters.entry(message_type.to_string()).or_insert(0);
        let index = *counter % self.builders.len();
        *counter = counter.wrapping_add(1);
        index
    }
}

impl AddressResolver for RoundRobinResolver {
    fn resolve(&self, message_type: &str) -> Option<Url> {
        let index = self.next_index(message_type);
        self.builders[index].build(message_type)
    }
}

/// Prefers the first base address, falling through past hosts reported
/// unavailable. When every host is unavailable the first is used.
pub struct FailoverResolver {
    builders: Vec<RequestAddressBuilder>,
    unavailable: RwLock<HashSet<String>>,
}

impl FailoverResolver {
    pub fn new(builders: Vec<RequestAddressBuilder>) -> Result<Self> {
        if builders.is_empty() {
            return Err(TransportError::Configuration(
                "failover resolution needs at least one address".to_string(),
            ));
        }
        Ok(Self {
            builders,
            unavailable: RwLock::new(HashSet::new()),
        })
    }

    fn host_key(address: &Url) -> String {
        format!(
            "{}://{}:{}",
            address.scheme().to_ascii_lowercase(),
            address.host_str().unwrap_or_default().to_ascii_lowercase(),
            address.port_or_known_default().unwrap_or_default()
        )
    }
}

impl AddressResolver for FailoverResolver {
    fn resolve(&self, message_type: &str) -> Option<Url> {
        let unavailable = self
            .unavailable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let builder = self
            .builders
            .iter()
            .find(|builder| !unavailable.contains(&Self::host_key(builder.base())))
            .unwrap_or(&self.builders[0]);
        builder.build(message_type)
    }

    fn mark_unavailable(&self, address: &Url) {
        let key = Self::host_key(address);
        warn!(host = %key, "Remote host marked unavailable");
        self.unavailable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
    }

    fn mark_available(&self, address: &Url) {
        let key = Self::host_key(address);
        let removed = self
            .unavailable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);
        if removed {
            debug!(host = %key, "Remote host available again");
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// How a remote base address is chosen among several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteAddressStrategy {
    RoundRobin,
    /// Always the first reachable address.
    #[default]
    PerDestinationHost,
}

/// One configured remote base address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteAddressSettings {
    pub url: String,
    pub strategy: Option<RemoteAddressStrategy>,
}

/// Address resolution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AddressingConfig {
    /// Base address of this bus's own endpoints.
    pub local_address: String,
    /// Candidate remote base addresses.
    pub remote: Vec<RemoteAddressSettings>,
    /// Strategy when `remote` is empty.
    pub strategy: Option<RemoteAddressStrategy>,
    /// Used when `remote` has no usable entry.
    pub fallback_address: String,
    pub request_path_prefix: String,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            local_address: "channel://local".to_string(),
            remote: Vec::new(),
            strategy: None,
            fallback_address: "channel://local".to_string(),
            request_path_prefix: DEFAULT_REQUEST_PATH_PREFIX.to_string(),
        }
    }
}

/// Remote base addresses and the strategy chosen for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddressResolution {
    pub addresses: Vec<Url>,
    pub strategy: RemoteAddressStrategy,
}

fn parse_address(raw: &str) -> Result<Url> {
    Url::parse(raw.trim())
        .map_err(|e| TransportError::Configuration(format!("invalid address '{raw}': {e}")))
}

impl AddressingConfig {
    /// Usable remote addresses and the effective strategy.
    ///
    /// Blank entries are skipped; with none left the fallback address is
    /// used. Any entry asking for round-robin makes the whole set
    /// round-robin. Without entries the top-level strategy applies.
    pub fn remote_resolution(&self) -> Result<RemoteAddressResolution> {
        if self.fallback_address.trim().is_empty() {
            return Err(TransportError::Configuration(
                "a fallback remote address is required".to_string(),
            ));
        }

        let mut addresses = Vec::new();
        for entry in &self.remote {
            if entry.url.trim().is_empty() {
                continue;
            }
            addresses.push(parse_address(&entry.url)?);
        }
        if addresses.is_empty() {
            addresses.push(parse_address(&self.fallback_address)?);
        }

        let strategy = if self.remote.is_empty() {
            self.strategy.unwrap_or_default()
        } else if self
            .remote
            .iter()
            .any(|entry| entry.strategy == Some(RemoteAddressStrategy::RoundRobin))
        {
            RemoteAddressStrategy::RoundRobin
        } else {
            RemoteAddressStrategy::PerDestinationHost
        };

        Ok(RemoteAddressResolution { addresses, strategy })
    }

    /// Resolver over the remote addresses.
    pub fn remote_resolver(&self) -> Result<Arc<dyn AddressResolver>> {
        let resolution = self.remote_resolution()?;
        let builders: Vec<RequestAddressBuilder> = resolution
            .addresses
            .into_iter()
            .map(|address| RequestAddressBuilder::new(address).with_prefix(&self.request_path_prefix))
            .collect();

        debug!(
            addresses = builders.len(),
            strategy = ?resolution.strategy,
            "Remote address resolver configured"
        );
        Ok(match resolution.strategy {
            RemoteAddressStrategy::RoundRobin => Arc::new(RoundRobinResolver::new(builders)?),
            RemoteAddressStrategy::PerDestinationHost => Arc::new(FailoverResolver::new(builders)?),
        })
    }

    /// Resolver over this bus's own base address.
    pub fn local_resolver(&self) -> Result<LocalAddressResolver> {
        let base = parse_address(&self.local_address)?;
        Ok(LocalAddressResolver::new(
            RequestAddressBuilder::new(base).with_prefix(&self.request_path_prefix),
        ))
    }
}

/// Whether two addresses name the same endpoint.
pub fn same_endpoint(a: &Url, b: &Url) -> bool {
    address_key(a) == address_key(b)
}
