//! Execution runtime for code modules.
//!
//! A [`Domain`] is the process-local home of loaded [`crate::ir::CodeModule`]s. It
//! interprets their method bodies, resolves members by name through per-module
//! [`DispatchTable`]s, serves runtime-library calls with [`NativeMethod`]s and hands
//! `dispatch` instructions to the [`Dispatcher`] installed for the site's client type.
//!
//! Both sides of a remote invocation run the same rewritten module in a domain. On the
//! client a dispatcher is installed and nomadic methods travel; on the server none is,
//! so every `dispatch` yields "not executed" and the method bodies run in place.
//!
//! # Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | `domain` | [`Domain`], [`LoadedModule`], [`TypeHandle`], [`MethodHandle`] |
//! | `dispatch` | [`DispatchTable`], [`Dispatcher`], [`NativeMethod`], [`ModuleResolver`] |
//! | `interpreter` | The step interpreter |
//! | `natives` | Built-in `System.*` natives |

mod dispatch;
mod domain;
mod interpreter;
mod natives;

pub use dispatch::{
    DispatchOutcome, DispatchRequest, DispatchTable, Dispatcher, ModuleResolver, NativeMethod,
    Overload,
};
pub use domain::{Domain, LoadedModule, MethodHandle, TypeHandle};
pub use natives::MAIN_THREAD_NAME;
