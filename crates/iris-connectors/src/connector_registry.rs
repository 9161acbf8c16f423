//! Connector registry.
//!
//! One lazily-built singleton per provider, shared by the ingress handler and
//! every worker. Because connectors cache per-channel credentials internally,
//! callers re-run `init` with the channel's stored config before use rather
//! than assuming the cached config belongs to their channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::connector_contract::{
    lock_unpoisoned, ChannelConnector, ChannelProvider, ConnectorError, ConnectorResult,
};
use crate::connector_email::EmailConnector;
use crate::connector_facebook::FacebookConnector;
use crate::connector_instagram::InstagramConnector;
use crate::connector_mock::MockConnector;
use crate::connector_telegram::TelegramConnector;
use crate::connector_whatsapp::WhatsappConnector;

/// Public struct `ConnectorRegistry` used across Iris components.
pub struct ConnectorRegistry {
    connectors: Mutex<BTreeMap<ChannelProvider, Arc<dyn ChannelConnector>>>,
    mock: Mutex<Option<Arc<MockConnector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Mutex::new(BTreeMap::new()),
            mock: Mutex::new(None),
        }
    }

    /// Returns the singleton connector for `provider`, constructing it on
    /// first use. Construction fails only on configuration-level problems
    /// such as an HTTP client that cannot be built.
    pub fn resolve(&self, provider: ChannelProvider) -> ConnectorResult<Arc<dyn ChannelConnector>> {
        let mut cache = lock_unpoisoned(&self.connectors);
        if let Some(existing) = cache.get(&provider) {
            return Ok(Arc::clone(existing));
        }
        let connector: Arc<dyn ChannelConnector> = match provider {
            ChannelProvider::Whatsapp => Arc::new(WhatsappConnector::new()?),
            ChannelProvider::Instagram => Arc::new(InstagramConnector::new()?),
            ChannelProvider::Facebook => Arc::new(FacebookConnector::new()?),
            ChannelProvider::Telegram => Arc::new(TelegramConnector::new()?),
            ChannelProvider::Email => Arc::new(EmailConnector::new()?),
            ChannelProvider::Mock => {
                let mock = Arc::new(MockConnector::new()?);
                *lock_unpoisoned(&self.mock) = Some(Arc::clone(&mock));
                mock
            }
        };
        cache.insert(provider, Arc::clone(&connector));
        Ok(connector)
    }

    /// Concrete handle to the mock connector singleton, for tests that want
    /// to inspect its sent-message log. Same instance `resolve` hands out.
    pub fn mock(&self) -> ConnectorResult<Arc<MockConnector>> {
        if let Some(existing) = lock_unpoisoned(&self.mock).as_ref() {
            return Ok(Arc::clone(existing));
        }
        self.resolve(ChannelProvider::Mock)?;
        lock_unpoisoned(&self.mock)
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| {
                ConnectorError::invalid_config(
                    ChannelProvider::Mock,
                    "mock connector slot was not populated",
                )
            })
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
