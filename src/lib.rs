//! # Whisperline
//!
//! Client core for end-to-end encrypted real-time chat.
//!
//! ## Features
//!
//! - **Hybrid encryption**: ChaCha20-Poly1305 message keys wrapped with RSA-OAEP
//! - **Durable identity** per user, with a cache of contact keys
//! - **Optimistic sending** with reconciliation against the broker's echo
//! - **Read receipts** and monotonic delivery status
//! - **Group conversations** with periodically refreshed rosters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use whisperline::{ChatClient, ClientConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ChatClient::open("alice", &ClientConfig::default())?;
//! client.connect().await?;
//!
//! client.messages().send("bob", "hello").await?;
//! for message in client.messages().messages_for_peer("bob") {
//!     println!("{}: {}", message.sender_id, message.plaintext);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 ChatClient                  │
//! │   MessageStore  |  GroupMessageStore        │
//! └──────┬───────────────┬───────────────┬──────┘
//!        │               │               │
//! ┌──────▼──────┐ ┌──────▼──────┐ ┌──────▼──────┐
//! │  KeyStore   │ │  Transport  │ │  REST api   │
//! │ CryptoEngine│ │  (broker)   │ │ keys/history│
//! └─────────────┘ └─────────────┘ └─────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod broker;
pub mod client;
pub mod config;
pub mod crypto;
pub mod keystore;
pub mod protocol;
pub mod store;
pub mod transport;

// Re-export main types at crate root
pub use client::{ChatClient, ClientError, ClientResult, Services};
pub use config::{ClientConfig, ReconnectPolicy};
pub use crypto::{CryptoEngine, CryptoError, CryptoResult, KeyPair, PublicKey};
pub use keystore::KeyStore;
pub use store::{GroupMessageStore, Message, MessageStatus, MessageStore, SendError, StoreEvent};
pub use transport::{ConnectionState, Transport, TransportError};
