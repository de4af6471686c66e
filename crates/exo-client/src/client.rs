//! The application-facing client.

use std::sync::Arc;

use exo_core::{Address, ConnectionState, Envelope, Transport};
use exo_discovery::{
    Candidate, Discovery, DockerCli, FileStore, LastUsedStore, MemoryStore, Resolution, TcpProber,
    running_in_container,
};
use exo_session::{ConnectionManager, DisplayState, EnvelopeRouter, spawn_projector};
use exo_transport::{FramedTransport, RawSocketTransport};
use futures::stream::BoxStream;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    config::ClientConfig,
    error::{ClientError, Result},
};

/// What to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRequest {
    /// A known backend.
    Address(Address),
    /// Find a backend among running containers.
    Discover,
}

/// Outcome of [`Client::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connecting {
    /// The session is starting against this address.
    Started(Address),
    /// Discovery found several backends; call [`Client::choose`].
    Choose(Vec<Candidate>),
}

/// One client session: discovery, connection manager and display state.
pub struct Client {
    config: ClientConfig,
    manager: ConnectionManager,
    discovery: Discovery,
    router: Arc<EnvelopeRouter>,
    display: watch::Receiver<DisplayState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Build a client with the real transports, the docker CLI and a file
    /// backed last-used store.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let primary = Arc::new(FramedTransport::new(config.framed_config()));
        let fallback = Arc::new(RawSocketTransport::new(config.raw_socket_config()));

        let store: Arc<dyn LastUsedStore> = match config
            .state_file()
            .map_or_else(FileStore::default_location, |path| Ok(FileStore::new(path)))
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!("Remembering the last backend in memory only: {e}");
                Arc::new(MemoryStore::new())
            }
        };
        let discovery = Discovery::new(
            Arc::new(DockerCli::new(config.docker_config())),
            Arc::new(TcpProber::new(config.probe_timeout())),
            store,
            config.discovery_config(),
        );

        Self::from_parts(config, primary, fallback, discovery)
    }

    /// Build a client from explicit parts.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn from_parts(
        config: ClientConfig,
        primary: Arc<dyn Transport>,
        fallback: Arc<dyn Transport>,
        discovery: Discovery,
    ) -> Self {
        let manager = ConnectionManager::new(primary, fallback, config.manager_config());
        let (display, projector) = spawn_projector(&manager);
        let router = Arc::new(EnvelopeRouter::new());
        let dispatcher = Arc::clone(&router).spawn_dispatcher(manager.frame_stream());

        Self {
            config,
            manager,
            discovery,
            router,
            display,
            tasks: vec![projector, dispatcher],
        }
    }

    /// Resolve the request to an address and start the session.
    ///
    /// # Errors
    /// Returns discovery errors, or [`ClientError::Manager`] if the
    /// connection manager is gone.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Connecting> {
        let address = match request {
            ConnectRequest::Address(address) => address,
            ConnectRequest::Discover => {
                if self.config.discovery.skip_in_container && running_in_container() {
                    tracing::info!("Running inside a container, skipping discovery");
                    self.config.address()
                } else {
                    match self.discovery.resolve().await? {
                        Resolution::Resolved(address) => address,
                        Resolution::Choose(candidates) => {
                            return Ok(Connecting::Choose(candidates));
                        }
                    }
                }
            }
        };
        self.manager.start(address.clone()).await?;
        Ok(Connecting::Started(address))
    }

    /// Finish a discovery that asked for a choice, and start the session.
    ///
    /// # Errors
    /// Returns [`exo_discovery::DiscoveryError::UnknownCandidate`] for an id
    /// that was not offered.
    pub async fn choose(&self, candidate_id: &str) -> Result<Address> {
        let address = self.discovery.confirm(candidate_id).await?;
        self.manager.start(address.clone()).await?;
        Ok(address)
    }

    /// Connect and wait until the session is up.
    ///
    /// # Errors
    /// Returns [`ClientError::ChoiceRequired`] if discovery needs the user to
    /// pick, or the manager's error if every attempt failed.
    pub async fn open(&self, request: ConnectRequest) -> Result<Address> {
        match self.connect(request).await? {
            Connecting::Started(address) => {
                self.manager.connected().await?;
                Ok(address)
            }
            Connecting::Choose(candidates) => Err(ClientError::ChoiceRequired(candidates)),
        }
    }

    /// Wait until the session is connected.
    ///
    /// # Errors
    /// Returns the manager's error if the retry budget ran out.
    pub async fn connected(&self) -> Result<()> {
        Ok(self.manager.connected().await?)
    }

    /// Send an envelope, queueing it while not connected.
    ///
    /// # Errors
    /// Returns error if the connection manager is gone.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        Ok(self.manager.send(envelope)?)
    }

    /// Close the session.
    ///
    /// # Errors
    /// Returns error if the connection manager is gone.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await?;
        Ok(())
    }

    /// Reconnect to the last address.
    ///
    /// # Errors
    /// Returns error if no session was ever started.
    pub async fn reconnect(&self) -> Result<()> {
        Ok(self.manager.reconnect().await?)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionState {
        self.manager.status()
    }

    #[must_use]
    pub fn status_stream(&self) -> BoxStream<'static, ConnectionState> {
        self.manager.status_stream()
    }

    #[must_use]
    pub fn frames(&self) -> broadcast::Receiver<Envelope> {
        self.manager.frames()
    }

    /// Display state for a status indicator.
    #[must_use]
    pub fn display(&self) -> watch::Receiver<DisplayState> {
        self.display.clone()
    }

    /// Per-type handlers for inbound envelopes.
    #[must_use]
    pub fn router(&self) -> &EnvelopeRouter {
        &self.router
    }

    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .field("display", &*self.display.borrow())
            .finish_non_exhaustive()
    }
}
