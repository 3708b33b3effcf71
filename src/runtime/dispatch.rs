//! Late binding by name and the seams the interpreter calls out through.
//!
//! # Organization
//!
//! | Item | Description |
//! |------|-------------|
//! | [`DispatchTable`] | Per-module map from `(type, method)` to its overloads, built at load time |
//! | [`Dispatcher`] | Handler for `dispatch` instructions, installed per execution client type |
//! | [`NativeMethod`] | Host implementation of a runtime-library method |
//! | [`ModuleResolver`] | Scoped hook consulted when a referenced module is not loaded |

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    ir::{CodeModule, DispatchSite, MethodDef, MethodKey, ObjectRef, ParamDef, Value},
    runtime::Domain,
    Result,
};

/// One callable overload of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct Overload {
    /// Identity of the method
    pub key: MethodKey,
    /// Declared parameters
    pub params: Vec<ParamDef>,
    /// Whether the method takes no receiver
    pub is_static: bool,
}

impl Overload {
    fn from_method(type_name: &str, method: &MethodDef) -> Self {
        Overload {
            key: method.key(type_name),
            params: method.params.clone(),
            is_static: method.is_static(),
        }
    }

    /// Checks whether `args` can be passed to this overload.
    ///
    /// Trailing optional parameters may be omitted; every supplied value must match its
    /// declared type.
    #[must_use]
    pub fn accepts(&self, args: &[Value]) -> bool {
        let required = self
            .params
            .iter()
            .take_while(|p| p.default.is_none())
            .count();
        args.len() >= required
            && args.len() <= self.params.len()
            && args
                .iter()
                .zip(&self.params)
                .all(|(arg, param)| arg.matches_type(&param.type_name))
    }
}

/// Registered mapping from `(type, method)` to the overloads a module defines.
///
/// Populated once when the module is loaded. Requests naming a method by string are
/// resolved here instead of through any reflection facility.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    module: String,
    entries: HashMap<(String, String), Vec<Overload>>,
}

impl DispatchTable {
    /// Builds the table for every method of every type in `module`.
    #[must_use]
    pub fn from_module(module: &CodeModule) -> Self {
        let mut entries: HashMap<(String, String), Vec<Overload>> = HashMap::new();
        for type_def in &module.types {
            let type_name = type_def.full_name();
            for method in &type_def.methods {
                entries
                    .entry((type_name.clone(), method.name.clone()))
                    .or_default()
                    .push(Overload::from_method(&type_name, method));
            }
        }
        DispatchTable {
            module: module.name.clone(),
            entries,
        }
    }

    /// Name of the module the table was built from.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// All overloads of `type_name::method`.
    #[must_use]
    pub fn overloads(&self, type_name: &str, method: &str) -> &[Overload] {
        self.entries
            .get(&(type_name.to_string(), method.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    /// Picks the first overload whose parameter types accept `args`.
    #[must_use]
    pub fn resolve(&self, type_name: &str, method: &str, args: &[Value]) -> Option<&Overload> {
        self.overloads(type_name, method)
            .iter()
            .find(|overload| overload.accepts(args))
    }

    /// Number of `(type, method)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the module defines no methods.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a `dispatch` instruction hands to its [`Dispatcher`].
pub struct DispatchRequest<'a> {
    /// The call site installed by the rewriter
    pub site: &'a DispatchSite,
    /// Receiver of the nomadic method, `None` for static methods
    pub receiver: Option<&'a ObjectRef>,
    /// The forwarded parameters, relay marker excluded
    pub args: &'a [Value],
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The call was not executed remotely; the method body runs locally
    NotExecuted,
    /// The call ran remotely and produced this value (`Null` for void methods)
    Executed(Value),
}

impl DispatchOutcome {
    /// The `(value, executed)` pair pushed by the `dispatch` instruction.
    #[must_use]
    pub fn into_stack_pair(self) -> (Value, bool) {
        match self {
            DispatchOutcome::NotExecuted => (Value::Null, false),
            DispatchOutcome::Executed(value) => (value, true),
        }
    }
}

/// Handler for the `dispatch` instructions of one execution client type.
pub trait Dispatcher: Send + Sync {
    /// Performs the remote invocation described by `request`.
    ///
    /// # Errors
    ///
    /// Any error aborts the calling method and propagates to its caller.
    fn dispatch(&self, domain: &Domain, request: DispatchRequest<'_>) -> Result<DispatchOutcome>;
}

type NativeFn = dyn Fn(&Domain, &[Value]) -> Result<Value> + Send + Sync;

/// A runtime-library method implemented by the host.
///
/// Natives are static: they receive the popped arguments and return a value, which is
/// pushed unless the native is void.
#[derive(Clone)]
pub struct NativeMethod {
    returns_value: bool,
    func: Arc<NativeFn>,
}

impl NativeMethod {
    /// A native returning a value.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Domain, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        NativeMethod {
            returns_value: true,
            func: Arc::new(func),
        }
    }

    /// A native returning nothing.
    pub fn void<F>(func: F) -> Self
    where
        F: Fn(&Domain, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        NativeMethod {
            returns_value: false,
            func: Arc::new(move |domain, args| func(domain, args).map(|()| Value::Null)),
        }
    }

    /// Whether the result is pushed onto the caller's stack.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    /// Runs the native.
    ///
    /// # Errors
    ///
    /// Propagates the native's failure.
    pub fn call(&self, domain: &Domain, args: &[Value]) -> Result<Value> {
        (self.func)(domain, args)
    }
}

impl fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMethod")
            .field("returns_value", &self.returns_value)
            .finish_non_exhaustive()
    }
}

/// Supplies module bytes for a module that is referenced but not loaded.
///
/// Returning `Ok(None)` means the resolver does not know the module either.
pub trait ModuleResolver: Send + Sync {
    /// Looks up the module file named `module_name`.
    ///
    /// # Errors
    ///
    /// Any error aborts the resolution and the member access that triggered it.
    fn resolve(&self, module_name: &str) -> Result<Option<Vec<u8>>>;
}

impl<F> ModuleResolver for F
where
    F: Fn(&str) -> Result<Option<Vec<u8>>> + Send + Sync,
{
    fn resolve(&self, module_name: &str) -> Result<Option<Vec<u8>>> {
        self(module_name)
    }
}
