//! Service container for one signed-in user
//!
//! `ChatClient` owns the key store, the broker connection, the REST
//! collaborators and both message stores, and wires transport callbacks to
//! the stores. Callbacks hold `Weak` references, so dropping the client
//! releases everything.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, GroupDirectory, HistoryService, KeyDirectory, RestClient};
use crate::config::{ClientConfig, ConfigError};
use crate::crypto::KeyPair;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::store::{GroupMessageStore, MessageStore, StoreOptions};
use crate::transport::{
    ConnectionState, Connector, Delivery, Transport, TransportConfig, TransportError, WebSocketConnector,
};

const DIRECT_HANDLER: &str = "direct-messages";
const GROUP_HANDLER: &str = "group-messages";
const RECEIPT_HANDLER: &str = "read-receipts";

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Identity or contact storage failed
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Broker connection failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// REST service failed
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// REST collaborators used by the stores
#[derive(Clone)]
pub struct Services {
    /// Public key directory
    pub keys: Arc<dyn KeyDirectory>,
    /// Stored direct and group messages
    pub history: Arc<dyn HistoryService>,
    /// Group rosters
    pub groups: Arc<dyn GroupDirectory>,
}

impl Services {
    /// One object serving all three roles
    pub fn shared<T>(service: Arc<T>) -> Self
    where
        T: KeyDirectory + HistoryService + GroupDirectory + 'static,
    {
        Self {
            keys: service.clone(),
            history: service.clone(),
            groups: service,
        }
    }
}

/// Everything one local user needs to chat
pub struct ChatClient {
    user_id: String,
    keys: Arc<KeyStore>,
    transport: Arc<Transport>,
    directory: Arc<dyn KeyDirectory>,
    messages: Arc<MessageStore>,
    groups: Arc<GroupMessageStore>,
}

impl ChatClient {
    /// Client talking to the broker and REST services named in `config`
    pub fn open(user_id: &str, config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let rest = Arc::new(RestClient::new(&config.api_base_url)?);
        let connector = Arc::new(WebSocketConnector::new(config.broker_url.clone()));
        Self::with_parts(user_id, config, connector, Services::shared(rest))
    }

    /// Client over an arbitrary connector and services
    pub fn with_parts(
        user_id: &str,
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        services: Services,
    ) -> ClientResult<Self> {
        config.validate()?;
        let keys = Arc::new(KeyStore::open(&config.data_dir, user_id, config.key_bits)?);
        let transport = Arc::new(Transport::new(connector, TransportConfig::from(config)));
        let options = StoreOptions::from(config);

        let messages = MessageStore::new(
            user_id,
            Arc::clone(&keys),
            Arc::clone(&transport),
            Arc::clone(&services.keys),
            Arc::clone(&services.history),
            options.clone(),
        );
        let groups = GroupMessageStore::new(
            user_id,
            Arc::clone(&transport),
            services.history,
            services.groups,
            options,
        );

        let direct = Arc::downgrade(&messages);
        transport.on_message(DIRECT_HANDLER, move |delivery: &Delivery| {
            if let Some(store) = direct.upgrade() {
                store.handle_delivery(delivery);
            }
        });
        let group = Arc::downgrade(&groups);
        transport.on_message(GROUP_HANDLER, move |delivery: &Delivery| {
            if let Some(store) = group.upgrade() {
                store.handle_delivery(delivery);
            }
        });
        let receipts = Arc::downgrade(&messages);
        transport.on_receipt(RECEIPT_HANDLER, move |delivery: &Delivery| {
            if let Some(store) = receipts.upgrade() {
                store.handle_receipt(delivery);
            }
        });

        Ok(Self {
            user_id: user_id.to_string(),
            keys,
            transport,
            directory: services.keys,
            messages,
            groups,
        })
    }

    /// Local user id
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Identity and contact keys
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Broker connection
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Direct conversations
    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    /// Group conversations
    pub fn groups(&self) -> &Arc<GroupMessageStore> {
        &self.groups
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Load or create the identity and publish its public key
    ///
    /// A failed publish is only logged; peers cannot message us until a
    /// later call succeeds.
    pub async fn initialize(&self) -> ClientResult<Arc<KeyPair>> {
        let identity = self.keys.ensure_identity()?;
        match self
            .directory
            .publish_public_key(&self.user_id, identity.public_key())
            .await
        {
            Ok(()) => info!(user = %self.user_id, fingerprint = %identity.public_key(), "public key published"),
            Err(e) => warn!(user = %self.user_id, error = %e, "could not publish public key"),
        }
        Ok(identity)
    }

    /// Initialize, then connect to the broker
    pub async fn connect(&self) -> ClientResult<()> {
        self.initialize().await?;
        self.transport.connect(&self.user_id).await?;
        Ok(())
    }

    /// Close the selection and the broker connection
    pub async fn disconnect(&self) {
        self.messages.deselect();
        self.groups.deselect().await;
        self.transport.disconnect().await;
    }

    /// Disconnect, drop every decrypted conversation and irreversibly
    /// delete the local identity and contacts
    pub async fn reset(&self) -> ClientResult<()> {
        self.disconnect().await;
        self.messages.clear();
        self.groups.clear().await;
        self.keys.wipe_identity()?;
        warn!(user = %self.user_id, "local identity deleted");
        Ok(())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for id in [DIRECT_HANDLER, GROUP_HANDLER, RECEIPT_HANDLER] {
            self.transport.remove_handler(id);
        }
    }
}
