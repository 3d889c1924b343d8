use std::{collections::BTreeMap, sync::Arc};

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    channel::ChannelClient,
    config::{ClientConfig, ConfigError},
    error::ChannelError,
    supervisor::{SupervisorError, SupervisorHandle, SupervisorSpec, spawn_supervisor},
    transport::{Connector, WsConnector},
};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("channel {name}: {source}")]
    Channel {
        name: String,
        #[source]
        source: ChannelError,
    },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Application-wide state built once at startup and handed to every consumer
/// (log tail, status view, backend supervisor) instead of module-level globals.
#[derive(Debug)]
pub struct AppContext {
    config: ClientConfig,
    channels: BTreeMap<String, ChannelClient>,
}

impl AppContext {
    pub fn from_config(config: ClientConfig) -> Result<Self, ContextError> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ContextError> {
        config.validate()?;
        let channel_config = config.channel_config();

        let mut channels = BTreeMap::new();
        for name in config.channels.keys() {
            let url = config.channel_url(name)?;
            let client =
                ChannelClient::with_connector(url, channel_config.clone(), Arc::clone(&connector))
                    .map_err(|source| ContextError::Channel {
                        name: name.clone(),
                        source,
                    })?;
            channels.insert(name.clone(), client);
        }

        Ok(Self { config, channels })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&ChannelClient> {
        self.channels.get(name)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Connects every channel; returns how many reached OPEN on the first try.
    /// Channels that failed keep retrying in the background.
    pub async fn connect_all(&self) -> usize {
        let results = join_all(
            self.channels
                .iter()
                .map(|(name, client)| async move { (name, client.connect().await) }),
        )
        .await;

        let mut opened = 0;
        for (name, result) in results {
            match result {
                Ok(()) => {
                    info!(channel = %name, "channel open");
                    opened += 1;
                }
                Err(err) => warn!(channel = %name, "channel not open yet: {err}"),
            }
        }
        opened
    }

    pub fn close_all(&self) {
        for client in self.channels.values() {
            client.close();
        }
    }

    /// Closes every channel and waits until each driver has flushed and exited.
    pub async fn shutdown(&self) {
        join_all(self.channels.values().map(|client| client.close_and_wait())).await;
    }

    /// Starts the backend supervisor when the config has a `backend` section.
    pub fn start_backend(&self) -> Result<Option<SupervisorHandle>, ContextError> {
        let Some(backend) = &self.config.backend else {
            return Ok(None);
        };
        let handle = spawn_supervisor(SupervisorSpec::from(backend))?;
        Ok(Some(handle))
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.close_all();
    }
}
