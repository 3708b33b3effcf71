//! The transport seam between execution client and server.
//!
//! A [`Channel`] is opened for one call, carries one or two exchanges (the second only
//! when the module has to be uploaded) and is then closed, or aborted after a failure.
//! Channels are obtained from a [`ChannelFactory`] by endpoint name.

use std::{
    collections::HashMap,
    sync::{mpsc, Arc, RwLock},
    thread,
    time::Duration,
};

use crate::{
    remote::{ExecutionServer, Request, ResultEnvelope},
    Error, Result,
};

/// One client-side connection to an execution server.
pub trait Channel: Send {
    /// The endpoint this channel talks to.
    fn endpoint(&self) -> &str;

    /// Opens the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the endpoint cannot be reached.
    fn open(&mut self) -> Result<()>;

    /// Sends `request` and blocks until the response arrives or `timeout` elapses.
    /// `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerTimeout`] if no response arrived in time and
    /// [`Error::Transport`] if the channel failed.
    fn exchange(&mut self, request: &Request, timeout: Option<Duration>) -> Result<ResultEnvelope>;

    /// Closes the channel after a successful call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the channel cannot be closed cleanly.
    fn close(&mut self) -> Result<()>;

    /// Tears the channel down after a failure. Never fails.
    fn abort(&mut self);
}

/// Creates channels by endpoint name.
pub trait ChannelFactory: Send + Sync {
    /// Creates an unopened channel towards `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the endpoint is unknown to the factory.
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Channel>>;
}

/// In-process servers addressable by endpoint name.
///
/// Each exchange runs on a fresh thread so that the client timeout applies exactly as
/// it would across a network.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use nomad::config::ServerConfig;
/// use nomad::remote::{ChannelFactory, ExecutionServer, LoopbackNetwork};
///
/// let network = LoopbackNetwork::new();
/// network.bind("node-a", Arc::new(ExecutionServer::new(ServerConfig::default())));
/// assert!(network.connect("node-a").is_ok());
/// assert!(network.connect("node-b").is_err());
/// ```
#[derive(Default)]
pub struct LoopbackNetwork {
    servers: RwLock<HashMap<String, Arc<ExecutionServer>>>,
}

impl LoopbackNetwork {
    /// An empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `server` reachable under `endpoint`, replacing any previous binding.
    pub fn bind(&self, endpoint: &str, server: Arc<ExecutionServer>) {
        write_lock!(self.servers).insert(endpoint.to_string(), server);
    }

    /// Removes the server bound to `endpoint`.
    pub fn unbind(&self, endpoint: &str) -> Option<Arc<ExecutionServer>> {
        write_lock!(self.servers).remove(endpoint)
    }
}

impl ChannelFactory for LoopbackNetwork {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Channel>> {
        let server = read_lock!(self.servers)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::Transport {
                endpoint: endpoint.to_string(),
                message: "no server bound to endpoint".to_string(),
            })?;
        Ok(Box::new(LoopbackChannel::new(endpoint, server)))
    }
}

/// A [`Channel`] to an in-process [`ExecutionServer`].
pub struct LoopbackChannel {
    endpoint: String,
    server: Arc<ExecutionServer>,
    open: bool,
}

impl LoopbackChannel {
    /// An unopened channel to `server`.
    #[must_use]
    pub fn new(endpoint: &str, server: Arc<ExecutionServer>) -> Self {
        LoopbackChannel {
            endpoint: endpoint.to_string(),
            server,
            open: false,
        }
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn disconnected(&self) -> Error {
        Error::Transport {
            endpoint: self.endpoint.clone(),
            message: "server thread ended without answering".to_string(),
        }
    }
}

impl Channel for LoopbackChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn exchange(&mut self, request: &Request, timeout: Option<Duration>) -> Result<ResultEnvelope> {
        if !self.open {
            return Err(Error::Transport {
                endpoint: self.endpoint.clone(),
                message: "channel is not open".to_string(),
            });
        }

        // The request crosses the boundary encoded, as it would on the wire.
        let payload = request.to_bytes()?;
        let server = self.server.clone();
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let response = Request::from_bytes(&payload)
                .map(|request| server.execute(request))
                .and_then(|envelope| envelope.to_bytes());
            // The client may have given up already.
            let _ = sender.send(response);
        });

        let response = match timeout {
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|error| match error {
                mpsc::RecvTimeoutError::Timeout => request.timeout_error(timeout),
                mpsc::RecvTimeoutError::Disconnected => self.disconnected(),
            })?,
            None => receiver.recv().map_err(|_| self.disconnected())?,
        }?;
        ResultEnvelope::from_bytes(&response)
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerConfig, ir::ExecutionMode, utils::DigestAlgorithm};

    #[test]
    fn test_exchange_requires_open_channel() {
        let server = Arc::new(ExecutionServer::new(ServerConfig::default()));
        let mut channel = LoopbackChannel::new("local", server);
        let request = Request::new(ExecutionMode::Normal, "Shop.nmod", "00", "Shop.X", "Run");

        assert!(matches!(
            channel.exchange(&request, None),
            Err(Error::Transport { .. })
        ));
        channel.open().unwrap();
        assert!(channel.is_open());
        channel.abort();
        assert!(!channel.is_open());
    }

    #[test]
    fn test_unknown_module_answers_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ExecutionServer::new(
            ServerConfig::default().with_sandbox_dir(dir.path()),
        ));
        let mut channel = LoopbackChannel::new("local", server);
        channel.open().unwrap();

        let hash = DigestAlgorithm::Sha1.digest(b"never deployed");
        let request = Request::new(ExecutionMode::Normal, "Shop.nmod", hash, "Shop.X", "Run");
        let envelope = channel
            .exchange(&request, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(envelope, ResultEnvelope::ModuleUnknown);
        channel.close().unwrap();
    }
}
