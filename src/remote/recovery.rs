//! Fault recoverers: decorators around the remote invocation delegate.
//!
//! A recoverer receives the endpoint the client resolved for a call and a delegate that
//! performs one complete attempt against a given endpoint. It never inspects or changes
//! the request or the response. Attempts are strictly sequential.
//!
//! An answer from the server is final: a user exception or a remote fault is returned
//! as is, without further attempts.

use std::{collections::BTreeMap, thread, time::Duration};

use crate::{error::RecoveryFailure, remote::ExecuteServiceCallResult, Error, Result};

/// One attempt of a remote invocation against an endpoint.
pub type Attempt<'a> = dyn FnMut(&str) -> Result<ExecuteServiceCallResult> + 'a;

/// Strategy for running the remote invocation delegate.
pub trait FaultRecoverer: Send + Sync {
    /// Runs `attempt` one or more times.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The endpoint the client resolved for this call
    /// * `attempt` - Performs one invocation against the endpoint it is given
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecoveryFailed`] when a multi-attempt strategy runs out of
    /// attempts, otherwise whatever the attempt returned. [`Error::UserException`]
    /// and [`Error::Remote`] are never wrapped.
    fn recover(&self, endpoint: &str, attempt: &mut Attempt<'_>) -> Result<ExecuteServiceCallResult>;
}

/// The server ran the request and answered; another attempt cannot change that.
fn is_final(error: &Error) -> bool {
    matches!(error, Error::UserException { .. } | Error::Remote(_))
}

/// Runs the delegate exactly once against the resolved endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl FaultRecoverer for Direct {
    fn recover(&self, endpoint: &str, attempt: &mut Attempt<'_>) -> Result<ExecuteServiceCallResult> {
        attempt(endpoint)
    }
}

/// Attempts the invocation up to a fixed number of times.
///
/// Every failed attempt's error is kept; when the last attempt fails the recoverer
/// raises [`Error::RecoveryFailed`] carrying all of them in order.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use nomad::remote::{FaultRecoverer, Retry};
/// use nomad::Error;
///
/// let retry = Retry::new(3).with_pause(Duration::from_millis(1));
/// let mut calls = 0;
/// let err = retry
///     .recover("node-a", &mut |_| {
///         calls += 1;
///         Err(Error::Error("down".into()))
///     })
///     .unwrap_err();
/// assert_eq!(calls, 3);
/// assert!(matches!(err, Error::RecoveryFailed(_)));
/// ```
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: usize,
    pause: Option<Duration>,
}

impl Retry {
    /// Up to `attempts` attempts, at least one.
    #[must_use]
    pub fn new(attempts: usize) -> Self {
        Retry {
            attempts: attempts.max(1),
            pause: None,
        }
    }

    /// Sleeps `pause` between attempts.
    #[must_use]
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl FaultRecoverer for Retry {
    fn recover(&self, endpoint: &str, attempt: &mut Attempt<'_>) -> Result<ExecuteServiceCallResult> {
        let mut errors = Vec::with_capacity(self.attempts);
        for number in 1..=self.attempts {
            match attempt(endpoint) {
                Ok(result) => return Ok(result),
                Err(error) if is_final(&error) => return Err(error),
                Err(error) => {
                    log::warn!(
                        "Attempt {number}/{} against {endpoint} failed: {error}",
                        self.attempts
                    );
                    errors.push(error);
                }
            }
            if number < self.attempts {
                if let Some(pause) = self.pause {
                    thread::sleep(pause);
                }
            }
        }
        Err(Error::RecoveryFailed(RecoveryFailure::Retry(errors)))
    }
}

/// Attempts the invocation against an ordered list of endpoints, stopping at the first
/// success.
///
/// The endpoint resolved by the client is ignored; the list is authoritative.
#[derive(Debug, Clone)]
pub struct Failover {
    endpoints: Vec<String>,
}

impl Failover {
    /// Fails over across `endpoints`, in order.
    #[must_use]
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Failover {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    /// The endpoints, in failover order.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

impl FaultRecoverer for Failover {
    fn recover(&self, _endpoint: &str, attempt: &mut Attempt<'_>) -> Result<ExecuteServiceCallResult> {
        let mut errors = BTreeMap::new();
        for endpoint in &self.endpoints {
            match attempt(endpoint) {
                Ok(result) => return Ok(result),
                Err(error) if is_final(&error) => return Err(error),
                Err(error) => {
                    log::warn!("Failover endpoint {endpoint} failed: {error}");
                    errors.insert(endpoint.clone(), error);
                }
            }
        }
        Err(Error::RecoveryFailed(RecoveryFailure::Failover(errors)))
    }
}
