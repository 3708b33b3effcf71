//! The execution domain: loaded modules and everything needed to run their code.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    config::DEFAULT_MAX_CALL_DEPTH,
    error::ReferenceKind,
    ir::{
        CodeModule, MethodDef, MethodKey, MethodRef, ObjectRef, TypeDef, TypeRef, Value,
        CONSTRUCTOR_NAME,
    },
    runtime::{
        interpreter::Interpreter, natives, Dispatcher, DispatchTable, ModuleResolver,
        NativeMethod,
    },
    utils::DigestAlgorithm,
    Error, Result,
};

/// A module loaded into a [`Domain`], with the exact bytes it was loaded from.
#[derive(Debug)]
pub struct LoadedModule {
    module: CodeModule,
    bytes: Vec<u8>,
    hash: String,
    path: Option<PathBuf>,
}

impl LoadedModule {
    /// Module file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// The decoded module.
    #[must_use]
    pub fn module(&self) -> &CodeModule {
        &self.module
    }

    /// The module file bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Content digest of [`Self::bytes`].
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// File the module was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// A type of a loaded module.
#[derive(Debug, Clone)]
pub struct TypeHandle {
    module: Arc<LoadedModule>,
    index: usize,
}

impl TypeHandle {
    /// The module defining the type.
    #[must_use]
    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    /// The type definition.
    #[must_use]
    pub fn type_def(&self) -> &TypeDef {
        &self.module.module.types[self.index]
    }

    /// Looks up a method by name and exact parameter types.
    #[must_use]
    pub fn method(&self, name: &str, param_types: &[String]) -> Option<MethodHandle> {
        self.type_def()
            .methods
            .iter()
            .position(|m| m.name == name && m.has_signature(param_types))
            .map(|method_index| MethodHandle {
                module: self.module.clone(),
                type_index: self.index,
                method_index,
            })
    }
}

/// A method of a loaded module.
#[derive(Debug, Clone)]
pub struct MethodHandle {
    module: Arc<LoadedModule>,
    type_index: usize,
    method_index: usize,
}

impl MethodHandle {
    /// The module defining the method.
    #[must_use]
    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    /// The declaring type.
    #[must_use]
    pub fn type_def(&self) -> &TypeDef {
        &self.module.module.types[self.type_index]
    }

    /// The method definition.
    #[must_use]
    pub fn method(&self) -> &MethodDef {
        &self.type_def().methods[self.method_index]
    }

    /// Identity of the method.
    #[must_use]
    pub fn key(&self) -> MethodKey {
        self.method().key(&self.type_def().full_name())
    }
}

/// Removes the installed resolver when the scope of [`Domain::with_resolver`] ends.
struct ResolverGuard<'a> {
    domain: &'a Domain,
}

impl Drop for ResolverGuard<'_> {
    fn drop(&mut self) {
        *write_lock!(self.domain.resolver) = None;
    }
}

/// A process-local runtime holding loaded code modules.
///
/// The domain owns:
/// - loaded modules by name, each with its bytes and content hash,
/// - a type index and one [`DispatchTable`] per module, built at load time,
/// - the static field store,
/// - [`NativeMethod`]s for the runtime library,
/// - [`Dispatcher`]s keyed by execution client type,
/// - an optional [`ModuleResolver`] installed for the duration of one scope.
///
/// Loaded code is immutable: a module name can be loaded once, and only the same
/// version may be loaded again.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{CodeModule, FieldDef, MethodBuilder, TypeDef, TypeRef, Value, INT32};
/// use nomad::runtime::Domain;
///
/// let counter = TypeRef::local("Shop.Counter");
/// let bump = MethodBuilder::new("Bump")
///     .returns(INT32)
///     .implementation(move |asm| {
///         asm.ldthis()
///             .ldthis()
///             .ldfld(&counter, "count")
///             .constant(Value::I32(1))
///             .add()
///             .stfld(&counter, "count")
///             .ldthis()
///             .ldfld(&counter, "count")
///             .ret();
///     })
///     .build()?;
/// let module = CodeModule::new("Shop.nmod").with_type(
///     TypeDef::new("Shop", "Counter")
///         .with_field(FieldDef::new("count", INT32).with_initial(Value::I32(5)))
///         .with_method(bump)
///         .with_default_constructor(),
/// );
///
/// let domain = Domain::new();
/// domain.load(module)?;
/// let counter = domain.construct("Shop.Counter")?;
/// let result = domain.invoke_by_values("Shop.Counter", "Bump", Some(&counter), vec![])?;
/// assert_eq!(result, Value::I32(6));
/// # Ok::<(), nomad::Error>(())
/// ```
pub struct Domain {
    host_name: String,
    digest: DigestAlgorithm,
    max_call_depth: usize,
    modules: RwLock<HashMap<String, Arc<LoadedModule>>>,
    types: RwLock<HashMap<String, TypeHandle>>,
    tables: RwLock<HashMap<String, Arc<DispatchTable>>>,
    statics: RwLock<HashMap<String, ObjectRef>>,
    natives: RwLock<HashMap<(String, String), NativeMethod>>,
    dispatchers: RwLock<HashMap<String, Arc<dyn Dispatcher>>>,
    resolver: RwLock<Option<Arc<dyn ModuleResolver>>>,
    resolver_section: Mutex<()>,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain {
    /// Creates an empty domain with the built-in natives registered.
    ///
    /// The host name is taken from `HOSTNAME` (or `COMPUTERNAME`), falling back to
    /// `localhost`.
    #[must_use]
    pub fn new() -> Self {
        let host_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        let domain = Domain {
            host_name,
            digest: DigestAlgorithm::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            modules: RwLock::new(HashMap::new()),
            types: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            statics: RwLock::new(HashMap::new()),
            natives: RwLock::new(HashMap::new()),
            dispatchers: RwLock::new(HashMap::new()),
            resolver: RwLock::new(None),
            resolver_section: Mutex::new(()),
        };
        natives::register_defaults(&domain);
        domain
    }

    /// Sets the name reported by `System.Environment::get_MachineName`.
    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Sets the algorithm used to hash loaded modules.
    #[must_use]
    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Sets the interpreter call depth limit.
    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Name of the host this domain runs on.
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Algorithm used to hash loaded modules.
    #[must_use]
    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Interpreter call depth limit.
    #[must_use]
    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    /// Loads a module from its file bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] / [`Error::Malformed`] for an invalid module file and
    /// [`Error::InvalidOperation`] if another version of the module, or another module
    /// defining one of its types, is already loaded.
    pub fn load_module(&self, bytes: Vec<u8>) -> Result<Arc<LoadedModule>> {
        self.load_bytes(bytes, None)
    }

    /// Loads a module file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be read, otherwise as
    /// [`Self::load_module`].
    pub fn load_file(&self, path: &Path) -> Result<Arc<LoadedModule>> {
        let bytes = std::fs::read(path)?;
        self.load_bytes(bytes, Some(path.to_path_buf()))
    }

    /// Loads an in-memory module, encoding it to obtain its bytes and hash.
    ///
    /// # Errors
    ///
    /// As [`Self::load_module`].
    pub fn load(&self, module: CodeModule) -> Result<Arc<LoadedModule>> {
        module.validate()?;
        let bytes = module.to_bytes()?;
        self.register(module, bytes, None)
    }

    fn load_bytes(&self, bytes: Vec<u8>, path: Option<PathBuf>) -> Result<Arc<LoadedModule>> {
        let module = CodeModule::from_bytes(&bytes)?;
        self.register(module, bytes, path)
    }

    fn register(
        &self,
        module: CodeModule,
        bytes: Vec<u8>,
        path: Option<PathBuf>,
    ) -> Result<Arc<LoadedModule>> {
        let hash = self.digest.digest(&bytes);

        let mut modules = write_lock!(self.modules);
        if let Some(existing) = modules.get(&module.name) {
            if existing.hash == hash {
                return Ok(existing.clone());
            }
            return Err(Error::InvalidOperation(format!(
                "Module '{}' is already loaded with hash {}, cannot load hash {}",
                module.name, existing.hash, hash
            )));
        }

        let mut types = write_lock!(self.types);
        for type_def in &module.types {
            let full_name = type_def.full_name();
            if let Some(owner) = types.get(&full_name) {
                return Err(Error::InvalidOperation(format!(
                    "Type '{}' of module '{}' is already defined by module '{}'",
                    full_name,
                    module.name,
                    owner.module.name()
                )));
            }
        }

        let table = Arc::new(DispatchTable::from_module(&module));
        let loaded = Arc::new(LoadedModule {
            module,
            bytes,
            hash,
            path,
        });

        let mut statics = write_lock!(self.statics);
        for (index, type_def) in loaded.module.types.iter().enumerate() {
            let full_name = type_def.full_name();
            let storage = ObjectRef::new(full_name.clone());
            for field in type_def.fields.iter().filter(|f| f.is_static()) {
                storage.set_field(field.name.clone(), field.initial_value());
            }
            statics.insert(full_name.clone(), storage);
            types.insert(
                full_name,
                TypeHandle {
                    module: loaded.clone(),
                    index,
                },
            );
        }
        write_lock!(self.tables).insert(loaded.name().to_string(), table);
        modules.insert(loaded.name().to_string(), loaded.clone());

        log::debug!(
            "Loaded module {} ({} types, hash {})",
            loaded.name(),
            loaded.module.types.len(),
            loaded.hash
        );
        Ok(loaded)
    }

    /// Looks up a loaded module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<Arc<LoadedModule>> {
        read_lock!(self.modules).get(name).cloned()
    }

    /// Names of all loaded modules.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read_lock!(self.modules).keys().cloned().collect();
        names.sort();
        names
    }

    /// The module defining `type_name`.
    #[must_use]
    pub fn module_of(&self, type_name: &str) -> Option<Arc<LoadedModule>> {
        read_lock!(self.types)
            .get(type_name)
            .map(|handle| handle.module.clone())
    }

    /// The dispatch table of a loaded module.
    #[must_use]
    pub fn dispatch_table(&self, module: &str) -> Option<Arc<DispatchTable>> {
        read_lock!(self.tables).get(module).cloned()
    }

    /// Looks up a loaded type by full name.
    #[must_use]
    pub fn find_type(&self, type_name: &str) -> Option<TypeHandle> {
        read_lock!(self.types).get(type_name).cloned()
    }

    /// Resolves a type reference, consulting the installed resolver for modules that
    /// are referenced but not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if the type cannot be found.
    pub fn resolve_type(&self, type_ref: &TypeRef) -> Result<TypeHandle> {
        if let Some(handle) = self.find_type(&type_ref.full_name) {
            return Ok(handle);
        }

        if let Some(scope) = &type_ref.scope {
            if self.module(scope).is_none() && self.resolve_module(scope)? {
                if let Some(handle) = self.find_type(&type_ref.full_name) {
                    return Ok(handle);
                }
            }
        }

        Err(Error::MemberNotFound {
            member: type_ref.full_name.clone(),
            type_name: type_ref.full_name.clone(),
            module: type_ref
                .scope
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string()),
        })
    }

    fn resolve_module(&self, module_name: &str) -> Result<bool> {
        let resolver = read_lock!(self.resolver).clone();
        let Some(resolver) = resolver else {
            return Ok(false);
        };
        match resolver.resolve(module_name)? {
            Some(bytes) => {
                let loaded = self.load_module(bytes)?;
                log::info!(
                    "Resolved dependency module {} (hash {})",
                    loaded.name(),
                    loaded.hash()
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolves an exact method reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if the type or the overload does not exist.
    pub fn resolve_method(&self, method: &MethodRef) -> Result<MethodHandle> {
        let type_handle = self.resolve_type(&method.owner)?;
        type_handle
            .method(&method.name, &method.param_types)
            .ok_or_else(|| Error::MemberNotFound {
                member: method.to_string(),
                type_name: method.owner.full_name.clone(),
                module: type_handle.module.name().to_string(),
            })
    }

    /// Resolves a method key against the loaded modules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if the type or the overload does not exist.
    pub fn method_handle(&self, key: &MethodKey) -> Result<MethodHandle> {
        let method = MethodRef {
            owner: TypeRef::local(key.type_name.clone()),
            name: key.name.clone(),
            param_types: key.param_types.clone(),
        };
        self.resolve_method(&method)
    }

    /// Creates an instance of `type_name` through its parameterless constructor.
    ///
    /// Instance fields start at their initial values before the constructor runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if the type or its parameterless constructor
    /// does not exist, or any error raised by the constructor.
    pub fn construct(&self, type_name: &str) -> Result<ObjectRef> {
        let handle = self.resolve_type(&TypeRef::local(type_name))?;
        let ctor = handle
            .method(CONSTRUCTOR_NAME, &[])
            .filter(|m| m.method().is_default_constructor())
            .ok_or_else(|| Error::MemberNotFound {
                member: CONSTRUCTOR_NAME.to_string(),
                type_name: type_name.to_string(),
                module: handle.module.name().to_string(),
            })?;

        let object = ObjectRef::new(type_name);
        for field in handle.type_def().fields.iter().filter(|f| !f.is_static()) {
            object.set_field(field.name.clone(), field.initial_value());
        }
        Interpreter::new(self).execute(&ctor, Some(object.clone()), Vec::new())?;
        Ok(object)
    }

    /// Invokes an exact method reference.
    ///
    /// Natives registered for the owner type and method name take precedence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] for unresolvable methods and propagates every
    /// error raised while running the method, user exceptions included.
    pub fn invoke(
        &self,
        method: &MethodRef,
        receiver: Option<&ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        if let Some(native) = self.native(&method.owner.full_name, &method.name) {
            return native.call(self, &args);
        }
        let handle = self.resolve_method(method)?;
        self.invoke_handle(&handle, receiver, args)
    }

    /// Invokes a resolved method.
    ///
    /// # Errors
    ///
    /// Propagates every error raised while running the method.
    pub fn invoke_handle(
        &self,
        handle: &MethodHandle,
        receiver: Option<&ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        Interpreter::new(self).execute(handle, receiver.cloned(), args)
    }

    /// Invokes `type_name::method_name`, choosing the overload by the run-time types of
    /// `args`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if the type is unknown or no overload accepts
    /// the arguments; otherwise propagates errors from the method.
    pub fn invoke_by_values(
        &self,
        type_name: &str,
        method_name: &str,
        receiver: Option<&ObjectRef>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let handle = self.resolve_overload(type_name, method_name, &args)?;
        self.invoke_handle(&handle, receiver, args)
    }

    /// Resolves `type_name::method_name` by the run-time types of `args` through the
    /// dispatch table of the defining module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemberNotFound`] if nothing matches.
    pub fn resolve_overload(
        &self,
        type_name: &str,
        method_name: &str,
        args: &[Value],
    ) -> Result<MethodHandle> {
        let type_handle = self.resolve_type(&TypeRef::local(type_name))?;
        let module = type_handle.module.name().to_string();
        let not_found = || Error::MemberNotFound {
            member: format!(
                "{}({})",
                method_name,
                args.iter()
                    .map(Value::type_name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            type_name: type_name.to_string(),
            module: module.clone(),
        };

        let table = self.dispatch_table(&module).ok_or_else(not_found)?;
        let overload = table
            .resolve(type_name, method_name, args)
            .ok_or_else(not_found)?;
        type_handle
            .method(&overload.key.name, &overload.key.param_types)
            .ok_or_else(not_found)
    }

    /// Reads a static field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceNotFound`] if the type has no such static field.
    pub fn get_static(&self, type_name: &str, field: &str) -> Result<Value> {
        self.static_storage(type_name, field)?
            .field(field)
            .ok_or_else(|| Self::missing_static(type_name, field))
    }

    /// Writes a static field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceNotFound`] if the type has no such static field.
    pub fn set_static(&self, type_name: &str, field: &str, value: Value) -> Result<()> {
        self.static_storage(type_name, field)?
            .set_field(field, value);
        Ok(())
    }

    fn static_storage(&self, type_name: &str, field: &str) -> Result<ObjectRef> {
        let handle = self.resolve_type(&TypeRef::local(type_name))?;
        if !handle
            .type_def()
            .field(field)
            .is_some_and(|f| f.is_static())
        {
            return Err(Self::missing_static(type_name, field));
        }
        read_lock!(self.statics)
            .get(type_name)
            .cloned()
            .ok_or_else(|| Self::missing_static(type_name, field))
    }

    fn missing_static(type_name: &str, field: &str) -> Error {
        Error::ReferenceNotFound {
            kind: ReferenceKind::Field,
            name: field.to_string(),
            owner: type_name.to_string(),
            method: "<static access>".to_string(),
        }
    }

    /// Registers a native implementation of `type_name::method`, replacing any previous one.
    pub fn register_native(&self, type_name: &str, method: &str, native: NativeMethod) {
        write_lock!(self.natives).insert((type_name.to_string(), method.to_string()), native);
    }

    /// Looks up a native.
    #[must_use]
    pub fn native(&self, type_name: &str, method: &str) -> Option<NativeMethod> {
        read_lock!(self.natives)
            .get(&(type_name.to_string(), method.to_string()))
            .cloned()
    }

    /// Installs the dispatcher for `dispatch` sites naming `client_type`.
    pub fn install_dispatcher(&self, client_type: &str, dispatcher: Arc<dyn Dispatcher>) {
        write_lock!(self.dispatchers).insert(client_type.to_string(), dispatcher);
    }

    /// Removes the dispatcher of `client_type`, returning it.
    pub fn remove_dispatcher(&self, client_type: &str) -> Option<Arc<dyn Dispatcher>> {
        write_lock!(self.dispatchers).remove(client_type)
    }

    /// The dispatcher installed for `client_type`.
    #[must_use]
    pub fn dispatcher(&self, client_type: &str) -> Option<Arc<dyn Dispatcher>> {
        read_lock!(self.dispatchers).get(client_type).cloned()
    }

    /// Runs `f` with `resolver` installed as the domain's module resolver.
    ///
    /// Scopes are serialized: only one resolver is ever installed, and it is removed
    /// when `f` returns or unwinds.
    pub fn with_resolver<R>(&self, resolver: Arc<dyn ModuleResolver>, f: impl FnOnce() -> R) -> R {
        let _section = lock!(self.resolver_section);
        *write_lock!(self.resolver) = Some(resolver);
        let _guard = ResolverGuard { domain: self };
        f()
    }

    /// Returns `true` while a resolver is installed.
    #[must_use]
    pub fn has_resolver(&self) -> bool {
        read_lock!(self.resolver).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{FieldDef, MethodBuilder, INT32},
        test::factories::counter_module,
    };

    #[test]
    fn test_load_is_idempotent_per_version() {
        let domain = Domain::new();
        let first = domain.load(counter_module()).unwrap();
        let again = domain.load(counter_module()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.hash().len(), 40);
        assert_eq!(domain.module_names(), vec!["Shop.nmod".to_string()]);

        let mut changed = counter_module();
        changed.types[0].fields.push(FieldDef::new("extra", INT32));
        assert!(matches!(
            domain.load(changed),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_construct_requires_default_constructor() {
        let domain = Domain::new();
        let mut module = counter_module();
        module.types[0].methods.retain(|m| m.name != CONSTRUCTOR_NAME);
        domain.load(module).unwrap();
        assert!(matches!(
            domain.construct("Shop.Counter"),
            Err(Error::MemberNotFound { .. })
        ));
    }

    #[test]
    fn test_statics() {
        let domain = Domain::new();
        domain.load(counter_module()).unwrap();
        assert_eq!(
            domain.get_static("Shop.Counter", "instances").unwrap(),
            Value::I32(0)
        );
        domain
            .set_static("Shop.Counter", "instances", Value::I32(2))
            .unwrap();
        assert_eq!(
            domain.get_static("Shop.Counter", "instances").unwrap(),
            Value::I32(2)
        );
        assert!(domain.get_static("Shop.Counter", "count").is_err());
    }

    #[test]
    fn test_resolver_is_scoped() {
        let domain = Domain::new();
        let dependency = CodeModule::new("Billing.nmod").with_type(
            TypeDef::new("Billing", "Rates").with_method(
                MethodBuilder::new("Vat")
                    .static_method()
                    .returns(INT32)
                    .implementation(|asm| {
                        asm.constant(Value::I32(20)).ret();
                    })
                    .build()
                    .unwrap(),
            ),
        );
        let bytes = dependency.to_bytes().unwrap();
        let vat = MethodRef::new(TypeRef::external("Billing.nmod", "Billing.Rates"), "Vat", &[]);

        assert!(domain.invoke(&vat, None, vec![]).is_err());

        let resolver: Arc<dyn ModuleResolver> = Arc::new(move |name: &str| -> Result<Option<Vec<u8>>> {
            Ok((name == "Billing.nmod").then(|| bytes.clone()))
        });
        let result = domain.with_resolver(resolver, || domain.invoke(&vat, None, vec![]));
        assert_eq!(result.unwrap(), Value::I32(20));
        assert!(!domain.has_resolver());
        assert!(domain.module("Billing.nmod").is_some());
    }
}
