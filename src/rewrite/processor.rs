//! Module-wide discovery and rewriting.
//!
//! [`ModuleProcessor::process`] runs the [`ReferenceDiscoverer`] over every nomadic
//! method of a module in parallel, then applies the [`MethodRewriter`] sequentially to a
//! copy of the module. Nothing is returned unless every method succeeds.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use rayon::prelude::*;

use crate::{
    analysis::{
        ModuleSet, ReachableMembers, ReferenceDiscoverer, DEFAULT_CLIENT_TYPE,
        DEFAULT_EXCLUDED_NAMESPACES,
    },
    ir::{CodeModule, MethodDef, MethodFlags, NomadAttribute},
    rewrite::{MethodRewriter, RewrittenMethod},
    utils::DigestAlgorithm,
    Error, Result,
};

/// Prefix of the resource keys holding bundled dependency modules.
pub const BUNDLE_RESOURCE_PREFIX: &str = "nomad.bundle/";

/// Returns the bytes of dependency `module_name` bundled into `module`, if any.
#[must_use]
pub fn bundled_module<'a>(module: &'a CodeModule, module_name: &str) -> Option<&'a [u8]> {
    module
        .resources
        .get(&format!("{BUNDLE_RESOURCE_PREFIX}{module_name}"))
        .map(Vec::as_slice)
}

/// Notification emitted once per processed module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingEvent {
    /// Name of the processed module
    pub module_name: String,
    /// Whether any nomadic method was found
    pub has_nomadic_elements: bool,
    /// Description of the error that aborted processing
    pub error: Option<String>,
}

type Listener = Box<dyn Fn(&ProcessingEvent) + Send + Sync>;

/// The output of processing one module.
#[derive(Debug, Clone)]
pub struct ProcessedModule {
    /// The rewritten module deployed with the client
    pub client: CodeModule,
    /// The copy deployed on servers, with relay entries tagged
    pub server: CodeModule,
    /// Every method that was rewritten
    pub methods: Vec<RewrittenMethod>,
    /// Names of the dependency modules embedded in the bundle
    pub bundle: BTreeSet<String>,
}

impl ProcessedModule {
    /// Writes the client module into `client_dir` and the server module into
    /// `server_dir`, both under the module's file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if a directory cannot be created or a file cannot be
    /// written, [`Error::Codec`] if encoding fails.
    pub fn write_to(&self, client_dir: &Path, server_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(client_dir)?;
        fs::create_dir_all(server_dir)?;

        let client_path = client_dir.join(&self.client.name);
        let server_path = server_dir.join(&self.server.name);
        fs::write(&client_path, self.client.to_bytes()?)?;
        fs::write(&server_path, self.server.to_bytes()?)?;
        Ok((client_path, server_path))
    }
}

/// A nomadic method located in the input module.
struct Target<'a> {
    type_index: usize,
    method_index: usize,
    type_name: String,
    method: &'a MethodDef,
    attribute: NomadAttribute,
}

/// Orchestrates discovery and rewriting of whole code modules.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{CodeModule, ExecutionMode, MethodBuilder, TypeDef};
/// use nomad::rewrite::ModuleProcessor;
///
/// let module = CodeModule::new("Ops.nmod").with_type(
///     TypeDef::new("Ops", "Jobs")
///         .with_method(
///             MethodBuilder::new("Run")
///                 .static_method()
///                 .nomadic(ExecutionMode::Relay)
///                 .build()?,
///         )
///         .with_default_constructor(),
/// );
///
/// let processed = ModuleProcessor::new().process(&module, &[])?.expect("nomadic");
/// assert_eq!(processed.methods.len(), 1);
/// assert!(processed.server.paired_hash.is_some());
/// # Ok::<(), nomad::Error>(())
/// ```
pub struct ModuleProcessor {
    client_type: String,
    excluded_namespaces: Vec<String>,
    digest: DigestAlgorithm,
    listeners: Vec<Listener>,
}

impl Default for ModuleProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleProcessor {
    /// A processor using the default execution client and excluded namespaces.
    #[must_use]
    pub fn new() -> Self {
        ModuleProcessor {
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            excluded_namespaces: DEFAULT_EXCLUDED_NAMESPACES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            digest: DigestAlgorithm::default(),
            listeners: Vec::new(),
        }
    }

    /// Names the execution client type installed into dispatch sites.
    #[must_use]
    pub fn with_client_type(mut self, client_type: &str) -> Self {
        self.client_type = client_type.to_string();
        self
    }

    /// Replaces the namespaces discovery does not descend into.
    #[must_use]
    pub fn with_excluded_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.excluded_namespaces = namespaces.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Digest used for the server module's paired hash. Must match the clients' digest.
    #[must_use]
    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Registers a callback receiving one [`ProcessingEvent`] per processed module.
    #[must_use]
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ProcessingEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Processes `module`, resolving cross-module references against `dependencies`.
    ///
    /// Methods that were already rewritten are left alone, so processing an output
    /// module again finds nothing to do.
    ///
    /// # Arguments
    ///
    /// * `module` - The module to process; never modified
    /// * `dependencies` - Modules `module` references; the ones nomadic methods reach
    ///   are bundled into the output
    ///
    /// # Returns
    ///
    /// `None` if the module has no nomadic methods left to rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceNotFound`] if discovery fails for any method and
    /// [`Error::InvalidNomadMethod`] if any method violates the preconditions of its
    /// mode. No output is produced in either case.
    pub fn process(
        &self,
        module: &CodeModule,
        dependencies: &[CodeModule],
    ) -> Result<Option<ProcessedModule>> {
        let result = self.process_module(module, dependencies);

        let event = ProcessingEvent {
            module_name: module.name.clone(),
            has_nomadic_elements: !matches!(result, Ok(None)),
            error: result.as_ref().err().map(ToString::to_string),
        };
        for listener in &self.listeners {
            listener(&event);
        }
        result
    }

    fn process_module(
        &self,
        module: &CodeModule,
        dependencies: &[CodeModule],
    ) -> Result<Option<ProcessedModule>> {
        let targets = Self::targets(module);
        if targets.is_empty() {
            log::debug!("Module {} has no nomadic methods", module.name);
            return Ok(None);
        }

        let rewriter = MethodRewriter::new(&self.client_type);
        for target in &targets {
            rewriter.check(
                &module.name,
                &module.types[target.type_index],
                target.method,
                target.attribute,
            )?;
        }

        let excluded: Vec<&str> = self.excluded_namespaces.iter().map(String::as_str).collect();
        let discoverer =
            ReferenceDiscoverer::new(ModuleSet::new(module).with_dependencies(dependencies))
                .with_client_type(&self.client_type)
                .with_excluded_namespaces(&excluded);
        let closures = targets
            .par_iter()
            .map(|target| discoverer.discover(&target.type_name, target.method))
            .collect::<Result<Vec<ReachableMembers>>>()?;

        let mut client = module.clone();
        let mut methods = Vec::with_capacity(targets.len());
        let mut bundle = BTreeSet::new();
        let mut relay_entries = Vec::new();
        for (target, reachable) in targets.iter().zip(closures) {
            bundle.extend(reachable.modules.iter().cloned());
            let rewritten = rewriter.rewrite(
                &module.name,
                &mut client.types[target.type_index],
                target.method_index,
                target.attribute,
                reachable,
            )?;
            if rewritten.relay_body.is_some() {
                relay_entries.push((target.type_index, target.method_index));
            }
            methods.push(rewritten);
        }

        for name in &bundle {
            let dependency = dependencies
                .iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| {
                    Error::Error(format!(
                        "Dependency module '{name}' required by '{}' was not supplied",
                        module.name
                    ))
                })?;
            client.resources.insert(
                format!("{BUNDLE_RESOURCE_PREFIX}{name}"),
                dependency.to_bytes()?,
            );
            if !client.references.contains(name) {
                client.references.push(name.clone());
            }
        }

        let mut server = client.clone();
        server.paired_hash = Some(self.digest.digest(&client.to_bytes()?));
        for (type_index, method_index) in relay_entries {
            server.types[type_index].methods[method_index].flags |=
                MethodFlags::SERVER_RELAY_ENTRY;
        }

        log::info!(
            "Processed module {}: {} nomadic methods rewritten, {} dependencies bundled",
            module.name,
            methods.len(),
            bundle.len()
        );

        Ok(Some(ProcessedModule {
            client,
            server,
            methods,
            bundle,
        }))
    }

    fn targets(module: &CodeModule) -> Vec<Target<'_>> {
        let mut targets = Vec::new();
        for (type_index, type_def) in module.types.iter().enumerate() {
            for (method_index, method) in type_def.methods.iter().enumerate() {
                if !module.is_nomadic(type_def, method) {
                    continue;
                }
                if method.flags.contains(MethodFlags::REWRITTEN) {
                    log::debug!(
                        "Skipping {}::{}, already rewritten",
                        type_def.full_name(),
                        method.name
                    );
                    continue;
                }
                targets.push(Target {
                    type_index,
                    method_index,
                    type_name: type_def.full_name(),
                    method,
                    attribute: method.nomad.unwrap_or_default(),
                });
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        ir::{ExecutionMode, FieldDef, MethodBuilder, TypeDef, TypeRef, Value, INT32},
        test::factories::{cart_module, counter_module, journal_module},
    };

    fn recorder() -> (Arc<Mutex<Vec<ProcessingEvent>>>, ModuleProcessor) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let processor =
            ModuleProcessor::new().with_listener(move |e| sink.lock().unwrap().push(e.clone()));
        (events, processor)
    }

    #[test]
    fn test_module_without_nomadic_methods() {
        let (events, processor) = recorder();
        let mut module = counter_module();
        for method in &mut module.types[0].methods {
            method.nomad = None;
        }

        assert!(processor.process(&module, &[]).unwrap().is_none());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].has_nomadic_elements);
        assert!(events[0].error.is_none());
    }

    #[test]
    fn test_server_copy_tags_relay_entries() {
        let processed = ModuleProcessor::new()
            .process(&journal_module(), &[])
            .unwrap()
            .unwrap();
        assert_eq!(processed.methods.len(), 2);

        let client_type = processed.client.type_def("Ops.Journal").unwrap();
        let server_type = processed.server.type_def("Ops.Journal").unwrap();
        let publish = |t: &TypeDef| {
            t.method("Publish", &["System.String".to_string()])
                .unwrap()
                .flags
        };
        assert!(!publish(client_type).contains(MethodFlags::SERVER_RELAY_ENTRY));
        assert!(publish(server_type).contains(MethodFlags::SERVER_RELAY_ENTRY));

        let client_hash = DigestAlgorithm::Sha1.digest(&processed.client.to_bytes().unwrap());
        assert_eq!(processed.server.paired_hash, Some(client_hash));
        assert!(processed.client.paired_hash.is_none());
    }

    #[test]
    fn test_processing_twice_finds_nothing() {
        let processor = ModuleProcessor::new();
        let processed = processor.process(&counter_module(), &[]).unwrap().unwrap();
        assert!(processor.process(&processed.client, &[]).unwrap().is_none());
    }

    #[test]
    fn test_records_closures() {
        let processed = ModuleProcessor::new()
            .process(&cart_module(), &[])
            .unwrap()
            .unwrap();
        let cart = processed.client.type_def("Shop.Cart").unwrap();
        let reachable = cart
            .method("Checkout", &[])
            .and_then(|m| m.reachable.as_ref())
            .unwrap();
        assert!(reachable.has_field("Shop.Cart", "total"));
        assert!(reachable.has_property("Shop.Cart", "Count"));
    }

    #[test]
    fn test_invalid_method_aborts_module() {
        let (events, processor) = recorder();
        let mut module = journal_module();
        module.types[0].methods.retain(|m| !m.is_default_constructor());

        let err = processor.process(&module, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidNomadMethod { .. }));
        let events = events.lock().unwrap();
        assert!(events[0].has_nomadic_elements);
        assert!(events[0].error.is_some());
    }

    #[test]
    fn test_bundles_reached_dependencies() {
        let rates = CodeModule::new("Rates.nmod").with_type(
            TypeDef::new("Rates", "Table")
                .with_method(
                    MethodBuilder::new("Vat")
                        .static_method()
                        .returns(INT32)
                        .implementation(|asm| {
                            asm.constant(Value::I32(20)).ret();
                        })
                        .build()
                        .unwrap(),
                )
                .with_default_constructor(),
        );
        let table = TypeRef::external("Rates.nmod", "Rates.Table");
        let shop = CodeModule::new("Till.nmod")
            .with_reference("Rates.nmod")
            .with_type(
                TypeDef::new("Till", "Register")
                    .with_field(FieldDef::new("vat", INT32))
                    .with_method(
                        MethodBuilder::new("Load")
                            .nomadic(ExecutionMode::Normal)
                            .returns(INT32)
                            .implementation(move |asm| {
                                asm.call(&table, "Vat", &[]).ret();
                            })
                            .build()
                            .unwrap(),
                    )
                    .with_default_constructor(),
            );

        let processed = ModuleProcessor::new()
            .process(&shop, &[rates.clone()])
            .unwrap()
            .unwrap();
        assert!(processed.bundle.contains("Rates.nmod"));
        let bytes = bundled_module(&processed.client, "Rates.nmod").unwrap();
        assert_eq!(CodeModule::from_bytes(bytes).unwrap(), rates);
        assert!(bundled_module(&processed.server, "Rates.nmod").is_some());
    }

    #[test]
    fn test_write_to() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ModuleProcessor::new()
            .process(&counter_module(), &[])
            .unwrap()
            .unwrap();
        let (client, server) = processed
            .write_to(&dir.path().join("client"), &dir.path().join("server"))
            .unwrap();
        let written = CodeModule::from_bytes(&fs::read(client).unwrap()).unwrap();
        assert_eq!(written, processed.client);
        assert!(server.ends_with("server/Shop.nmod"));
    }
}
