//! Scheme-based selection of transport factories and hosts.
//!
//! [`TransportRegistry`] knows which factory builds hosts for which address
//! schemes. [`TransportHostProvider`] holds the running hosts and answers
//! "which host serves this destination?". An address whose scheme nothing
//! serves is a configuration error.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use url::Url;

use super::settings::TransportSettings;
use super::{Result, TransportError, TransportHost};

/// Builds hosts for a family of address schemes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Display name, e.g. "RabbitMQ".
    fn name(&self) -> &str;

    /// Schemes this factory serves; matched case-insensitively.
    fn supported_schemes(&self) -> &[&'static str];

    /// Build a host. Settings of another backend kind are rejected.
    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>>;
}

/// Registered transport factories.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every factory compiled into this build.
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut factories: Vec<Arc<dyn TransportFactory>> = Vec::new();
        #[cfg(feature = "channel")]
        factories.push(Arc::new(super::channel::ChannelTransportFactory));
        #[cfg(feature = "amqp")]
        factories.push(Arc::new(super::amqp::AmqpTransportFactory));
        #[cfg(feature = "kafka")]
        factories.push(Arc::new(super::kafka::KafkaTransportFactory));
        #[cfg(feature = "sns-sqs")]
        factories.push(Arc::new(super::sns_sqs::SnsSqsTransportFactory));
        #[cfg(feature = "grpc")]
        factories.push(Arc::new(super::grpc::GrpcTransportFactory));
        Self { factories }
    }

    /// Add a factory. A scheme already claimed by a differently named
    /// factory is a configuration error; re-registering the same factory is
    /// a no-op.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) -> Result<()> {
        for existing in &self.factories {
            if existing.name() == factory.name() {
                return Ok(());
            }
            for scheme in factory.supported_schemes() {
                if supports(existing.as_ref(), scheme) {
                    return Err(TransportError::Configuration(format!(
                        "scheme '{scheme}' is already served by the {} transport",
                        existing.name()
                    )));
                }
            }
        }
        self.factories.push(factory);
        Ok(())
    }

    pub fn factories(&self) -> &[Arc<dyn TransportFactory>] {
        &self.factories
    }

    pub fn try_resolve(&self, address: &Url) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .iter()
            .find(|factory| supports(factory.as_ref(), address.scheme()))
            .cloned()
    }

    pub fn resolve(&self, address: &Url) -> Result<Arc<dyn TransportFactory>> {
        self.try_resolve(address).ok_or_else(|| {
            TransportError::Configuration(format!(
                "no transport registered for scheme '{}'",
                address.scheme()
            ))
        })
    }
}

fn supports(factory: &dyn TransportFactory, scheme: &str) -> bool {
    factory
        .supported_schemes()
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(scheme))
}

/// Cargo feature a settings kind needs, when it is not compiled in.
fn missing_feature(settings: &TransportSettings) -> Option<&'static str> {
    match settings {
        TransportSettings::Channel(_) if !cfg!(feature = "channel") => Some("channel"),
        TransportSettings::Amqp(_) if !cfg!(feature = "amqp") => Some("amqp"),
        TransportSettings::Kafka(_) if !cfg!(feature = "kafka") => Some("kafka"),
        TransportSettings::SnsSqs(_) if !cfg!(feature = "sns-sqs") => Some("sns-sqs"),
        TransportSettings::Grpc(_) if !cfg!(feature = "grpc") => Some("grpc"),
        _ => None,
    }
}

struct HostEntry {
    schemes: Vec<String>,
    host: Arc<dyn TransportHost>,
}

/// Running hosts indexed by the schemes they serve.
#[derive(Default)]
pub struct TransportHostProvider {
    entries: Vec<HostEntry>,
}

impl TransportHostProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider serving each host under its own address scheme.
    pub fn from_hosts(hosts: impl IntoIterator<Item = Arc<dyn TransportHost>>) -> Self {
        let mut provider = Self::new();
        for host in hosts {
            provider.add_host(host, &[]);
        }
        provider
    }

    /// Build one host per settings entry through the registry.
    pub async fn from_settings(
        registry: &TransportRegistry,
        settings: &[TransportSettings],
    ) -> Result<Self> {
        let mut provider = Self::new();
        for entry in settings {
            if let Some(feature) = missing_feature(entry) {
                return Err(TransportError::Configuration(format!(
                    "transport kind '{}' requires the '{feature}' feature",
                    entry.kind()
                )));
            }
            let address = entry.address()?;
            let factory = registry.resolve(&address)?;
            let host = factory.create_host(entry).await?;
            info!(transport = factory.name(), address = %address, "Transport host created");
            provider.add_host(host, factory.supported_schemes());
        }
        Ok(provider)
    }

    /// Serve `host` for its own address scheme plus `aliases`.
    pub fn add_host(&mut self, host: Arc<dyn TransportHost>, aliases: &[&str]) {
        let mut schemes = vec![host.address().scheme().to_ascii_lowercase()];
        for alias in aliases {
            let alias = alias.to_ascii_lowercase();
            if !schemes.contains(&alias) {
                schemes.push(alias);
            }
        }
        self.entries.push(HostEntry { schemes, host });
    }

    /// Host serving `address`. When several hosts share the scheme, the one
    /// whose host and port match wins, then the one whose host matches;
    /// otherwise the first registered.
    pub fn try_get_host(&self, address: &Url) -> Option<Arc<dyn TransportHost>> {
        let scheme = address.scheme().to_ascii_lowercase();
        let candidates: Vec<&HostEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.schemes.contains(&scheme))
            .collect();

        let authority = address.host_str().map(str::to_ascii_lowercase);
        let same_host = |entry: &&&HostEntry| {
            entry.host.address().host_str().map(str::to_ascii_lowercase) == authority
        };
        candidates
            .iter()
            .find(|entry| same_host(entry) && entry.host.address().port() == address.port())
            .or_else(|| candidates.iter().find(same_host))
            .or_else(|| candidates.first())
            .map(|entry| entry.host.clone())
    }

    pub fn get_host(&self, address: &Url) -> Result<Arc<dyn TransportHost>> {
        self.try_get_host(address).ok_or_else(|| {
            TransportError::Configuration(format!(
                "no transport host registered for scheme '{}'",
                address.scheme()
            ))
        })
    }

    /// Check every address resolves to a host. Intended for startup.
    pub fn validate<'a>(&self, addresses: impl IntoIterator<Item = &'a Url>) -> Result<()> {
        for address in addresses {
            self.get_host(address)?;
        }
        Ok(())
    }

    /// Hosts in registration order.
    pub fn hosts(&self) -> Vec<Arc<dyn TransportHost>> {
        self.entries.iter().map(|entry| entry.host.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
