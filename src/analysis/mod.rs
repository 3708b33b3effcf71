//! Static analysis of code-module method bodies.
//!
//! This module computes which non-local state a method may touch, so that exactly the
//! right execution context can travel with a remote invocation.
//!
//! # Architecture
//!
//! - [`ReferenceDiscoverer`] - walks a method body and its callees over a [`ModuleSet`]
//! - [`ReachableMembers`] - the resulting closure of fields, properties, methods and modules
//! - [`Visit`] - the per-reference outcome that drives the walk
//!
//! # Usage
//!
//! ```rust,ignore
//! use nomad::analysis::{ModuleSet, ReferenceDiscoverer};
//!
//! let discoverer = ReferenceDiscoverer::new(ModuleSet::new(&module));
//! let members = discoverer.discover("Shop.Cart", checkout)?;
//! for field in &members.fields {
//!     println!("ships {field}");
//! }
//! ```

mod discovery;
mod members;

pub use discovery::{
    ModuleSet, ReferenceDiscoverer, Visit, DEFAULT_CLIENT_TYPE, DEFAULT_EXCLUDED_NAMESPACES,
};
pub use members::{MemberId, ReachableMembers};
