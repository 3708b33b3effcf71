// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # nomad
//!
//! Mobile methods for code modules: methods marked *nomadic* are rewritten at build
//! time so that, at run time, calling them executes them on a remote host, together
//! with the object state they touch.
//!
//! ## How it works
//!
//! 1. **Discovery** - [`analysis::ReferenceDiscoverer`] walks a nomadic method's body
//!    and everything it calls, collecting the fields, properties and methods it reaches.
//! 2. **Rewriting** - [`rewrite::ModuleProcessor`] installs a `dispatch` prefix in front
//!    of every nomadic method according to its [`ir::ExecutionMode`], produces a paired
//!    server module and bundles the dependency modules the methods need.
//! 3. **Client** - [`remote::ExecutionClient`] is installed as the dispatcher of a
//!    [`runtime::Domain`]. It snapshots the reachable state, sends a
//!    [`remote::Request`] through a [`remote::Channel`] and writes the returned state
//!    back onto the live object.
//! 4. **Server** - [`remote::ExecutionServer`] loads the module version named by the
//!    request, applies the state, runs the method and answers with a
//!    [`remote::ResultEnvelope`].
//!
//! ## Execution modes
//!
//! | Mode | Runs on the server | Runs locally |
//! |------|--------------------|--------------|
//! | `Normal` | yes, state travels both ways | only when dispatch is disabled |
//! | `Relay` | yes | never |
//! | `Repeat` | yes | yes, after the remote call |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nomad::prelude::*;
//!
//! // Build time: rewrite the module
//! let module = CodeModule::from_bytes(&std::fs::read("Shop.nmod")?)?;
//! let processed = ModuleProcessor::new()
//!     .process(&module, &[])?
//!     .expect("module declares nomadic methods");
//!
//! // Run time: a server and a client sharing one process
//! let network = Arc::new(LoopbackNetwork::new());
//! network.bind("node-a", Arc::new(ExecutionServer::new(ServerConfig::new())));
//!
//! let domain = Domain::new();
//! domain.load(processed.client)?;
//! let client = Arc::new(ExecutionClient::new(
//!     ClientConfig::new().with_default_endpoint("node-a"),
//!     network,
//! ));
//! client.install(&domain);
//!
//! let counter = domain.construct("Shop.Counter")?;
//! domain.invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])?;
//! # Ok::<(), nomad::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]. User code exceptions raised on a
//! server come back as [`Error::UserException`] with their original contents.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use nomad::prelude::*;
///
/// let config = NomadConfig::disabled();
/// assert!(!config.client.enabled);
/// ```
pub mod prelude;

/// Code-module intermediate representation.
pub mod ir;

/// Execution runtime: domains, dispatch tables and the interpreter.
pub mod runtime;

/// Variables: the transferable representation of fields, properties and parameters.
pub mod variable;

/// Reference discovery over method bodies.
pub mod analysis;

/// Build-time rewriting of nomadic methods.
pub mod rewrite;

/// Remote execution: envelopes, channels, client, server and fault recovery.
pub mod remote;

/// Client and server configuration.
pub mod config;

/// Content digests and wire codecs.
pub mod utils;

/// `nomad` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `nomad` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use nomad::{ir::CodeModule, Error};
///
/// match CodeModule::from_bytes(&std::fs::read("Shop.nmod")?) {
///     Ok(module) => println!("{} types", module.types.len()),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {message}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
pub use error::Error;

/// Failure details of a fault recoverer.
pub use error::{RecoveryFailure, ReferenceKind};
