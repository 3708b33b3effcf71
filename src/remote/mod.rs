//! Remote execution of nomadic methods.
//!
//! The client half runs inside the calling process as the [`crate::runtime::Dispatcher`]
//! of rewritten methods; the server half runs the requested method in its own
//! [`crate::runtime::Domain`] and answers with a [`ResultEnvelope`].
//!
//! # Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | [`Request`], [`ResultEnvelope`], [`RemoteFault`], [`ExecuteServiceCallResult`] |
//! | `channel` | [`Channel`] / [`ChannelFactory`] and the in-process [`LoopbackNetwork`] |
//! | `mailbox` | Store-and-forward transport: [`Mailbox`], [`MailboxChannel`], [`MailboxListener`] |
//! | `client` | [`ExecutionClient`] |
//! | `server` | [`ExecutionServer`] and its module cache |
//! | `recovery` | [`FaultRecoverer`]: [`Direct`], [`Retry`], [`Failover`] |
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nomad::config::{ClientConfig, ServerConfig};
//! use nomad::remote::{ExecutionClient, ExecutionServer, Failover, LoopbackNetwork};
//! use nomad::runtime::Domain;
//!
//! let network = Arc::new(LoopbackNetwork::new());
//! network.bind("primary", Arc::new(ExecutionServer::new(ServerConfig::new())));
//! network.bind("standby", Arc::new(ExecutionServer::new(ServerConfig::new())));
//!
//! let client = Arc::new(
//!     ExecutionClient::new(ClientConfig::new(), network)
//!         .with_recoverer(Arc::new(Failover::new(["primary", "standby"]))),
//! );
//! let domain = Domain::new();
//! domain.load_file("out/client/Shop.nmod".as_ref())?;
//! client.install(&domain);
//! # Ok::<(), nomad::Error>(())
//! ```

mod cache;
mod channel;
mod client;
mod envelope;
mod mailbox;
mod recovery;
mod server;

pub use channel::{Channel, ChannelFactory, LoopbackChannel, LoopbackNetwork};
pub use client::{ExecutionClient, ServiceCall};
pub use envelope::{ExecuteServiceCallResult, FaultKind, RemoteFault, Request, ResultEnvelope};
pub use mailbox::{
    parse_request, parse_response, request_message, response_message, InMemoryMailbox,
    MailMessage, Mailbox, MailboxChannel, MailboxListener, MailboxNetwork, PollReport,
    REQUEST_SUBJECT_PREFIX, RESPONSE_SUBJECT_PREFIX,
};
pub use recovery::{Attempt, Direct, FaultRecoverer, Failover, Retry};
pub use server::ExecutionServer;
