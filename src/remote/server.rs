//! The execution server: runs requested methods against a private [`Domain`].
//!
//! For each [`Request`] the server
//!
//! 1. stores an attached module upload under `sandbox/<hash>/`,
//! 2. finds the module by name and hash on the probe paths or in the sandbox, answering
//!    [`ResultEnvelope::ModuleUnknown`] when it cannot,
//! 3. loads it once per version through the [`ModuleCache`], refusing other versions,
//! 4. constructs a receiver for instance methods and applies the supplied non-locals,
//! 5. invokes the method by name with a scoped resolver that serves bundled
//!    dependencies,
//! 6. reads the non-locals back and answers with the return value.
//!
//! The server's domain never has a dispatcher installed, so rewritten methods run their
//! bodies in place instead of dispatching again.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
};

use crate::{
    config::ServerConfig,
    ir::{CodeModule, ExecutionMode, MethodFlags, ObjectRef, TypeRef, Value, BOOL},
    remote::{cache::ModuleCache, RemoteFault, Request, ResultEnvelope},
    rewrite::bundled_module,
    runtime::{Domain, LoadedModule, MethodHandle, ModuleResolver, MAIN_THREAD_NAME},
    utils::is_hex_digest,
    variable::{apply_non_locals, refresh_non_locals},
    Error, Result,
};

type Job = Box<dyn FnOnce() + Send>;

/// Shared server state, reachable from the main-thread worker.
struct ServerState {
    config: ServerConfig,
    domain: Arc<Domain>,
    cache: ModuleCache,
}

/// Runs nomadic methods on behalf of execution clients.
///
/// # Examples
///
/// ```rust
/// use nomad::config::ServerConfig;
/// use nomad::ir::ExecutionMode;
/// use nomad::remote::{ExecutionServer, Request, ResultEnvelope};
/// use nomad::utils::DigestAlgorithm;
///
/// let dir = tempfile::tempdir()?;
/// let server = ExecutionServer::new(ServerConfig::new().with_sandbox_dir(dir.path()));
/// let hash = DigestAlgorithm::Sha1.digest(b"not deployed here");
/// let request = Request::new(ExecutionMode::Normal, "Shop.nmod", hash, "Shop.Cart", "Checkout");
/// assert_eq!(server.execute(request), ResultEnvelope::ModuleUnknown);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ExecutionServer {
    state: Arc<ServerState>,
    main_thread: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ExecutionServer {
    /// A server with a fresh domain configured from `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let domain = Domain::new().with_max_call_depth(config.max_call_depth);
        Self::with_domain(config, Arc::new(domain))
    }

    /// A server executing in `domain`.
    ///
    /// The domain must not have a dispatcher installed for the execution client type,
    /// otherwise rewritten methods would dispatch again instead of running.
    #[must_use]
    pub fn with_domain(config: ServerConfig, domain: Arc<Domain>) -> Self {
        ExecutionServer {
            state: Arc::new(ServerState {
                config,
                domain,
                cache: ModuleCache::new(),
            }),
            main_thread: Mutex::new(None),
        }
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// The domain requests execute in.
    #[must_use]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.state.domain
    }

    /// Number of module versions loaded on behalf of requests.
    #[must_use]
    pub fn loaded_versions(&self) -> usize {
        self.state.cache.len()
    }

    /// Executes `request` and answers with a result envelope.
    ///
    /// Never fails: every error, including exceptions thrown by the invoked method, is
    /// reported as [`ResultEnvelope::Fault`].
    pub fn execute(&self, request: Request) -> ResultEnvelope {
        let target = format!("{}::{}", request.type_full_name, request.method_name);
        let result = if request.run_on_main_thread {
            self.execute_on_main_thread(request)
        } else {
            self.state.execute(&request)
        };

        match result {
            Ok(envelope) => envelope,
            Err(error) => {
                match &error {
                    Error::UserException { .. } => {
                        log::warn!("{target} threw on the server: {error}");
                    }
                    Error::StaleModule { .. } => {}
                    other => log::warn!("Request for {target} failed: {other}"),
                }
                ResultEnvelope::Fault(RemoteFault::from_error(&error))
            }
        }
    }

    fn execute_on_main_thread(&self, request: Request) -> Result<ResultEnvelope> {
        let sender = {
            let mut worker = self.main_thread.lock().map_err(|_| Error::LockError)?;
            match worker.as_ref() {
                Some(sender) => sender.clone(),
                None => {
                    let sender = spawn_main_thread()?;
                    *worker = Some(sender.clone());
                    sender
                }
            }
        };

        let state = self.state.clone();
        let (reply, response) = mpsc::channel();
        let job: Job = Box::new(move || {
            let _ = reply.send(state.execute(&request));
        });
        sender
            .send(job)
            .map_err(|_| Error::Error("Main thread worker has stopped".to_string()))?;
        response
            .recv()
            .map_err(|_| Error::Error("Main thread worker dropped the request".to_string()))?
    }
}

fn spawn_main_thread() -> Result<mpsc::Sender<Job>> {
    let (sender, jobs) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name(MAIN_THREAD_NAME.to_string())
        .spawn(move || {
            for job in jobs {
                job();
            }
        })?;
    Ok(sender)
}

impl ServerState {
    fn execute(&self, request: &Request) -> Result<ResultEnvelope> {
        Self::validate(request)?;

        if let Some(bytes) = &request.module_bytes {
            self.store_upload(request, bytes)?;
        }

        let Some(loaded) = self
            .cache
            .resolve(&self.domain, request, || self.probe(request))?
        else {
            log::debug!(
                "Module {} ({}) unknown, asking for upload",
                request.module_file_name,
                request.module_hash
            );
            return Ok(ResultEnvelope::ModuleUnknown);
        };

        let resolver: Arc<dyn ModuleResolver> = Arc::new(BundleResolver {
            module: loaded.clone(),
            probe_paths: self.config.probe_paths.clone(),
            sandbox: self.config.sandbox_for(&request.module_hash),
        });
        self.domain
            .with_resolver(resolver, || self.invoke(request))
    }

    fn validate(request: &Request) -> Result<()> {
        if !is_hex_digest(&request.module_hash) {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a module digest",
                request.module_hash
            )));
        }
        if !is_plain_file_name(&request.module_file_name) {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a plain module file name",
                request.module_file_name
            )));
        }
        Ok(())
    }

    fn store_upload(&self, request: &Request, bytes: &[u8]) -> Result<()> {
        let digest = self.domain.digest().digest(bytes);
        if digest != request.module_hash {
            return Err(Error::InvalidOperation(format!(
                "Uploaded {} hashes to {digest}, request names {}",
                request.module_file_name, request.module_hash
            )));
        }

        let dir = self.config.sandbox_for(&request.module_hash);
        let path = dir.join(&request.module_file_name);
        if !path.exists() {
            fs::create_dir_all(&dir)?;
            fs::write(&path, bytes)?;
            log::info!(
                "Stored uploaded module {} at {}",
                request.module_file_name,
                path.display()
            );
        }
        Ok(())
    }

    /// Finds a file named after the module whose digest, or whose paired client digest,
    /// equals the requested hash.
    fn probe(&self, request: &Request) -> Result<Option<PathBuf>> {
        let sandbox = self.config.sandbox_for(&request.module_hash);
        let candidates = self
            .config
            .probe_paths
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(sandbox.as_path()))
            .map(|dir| dir.join(&request.module_file_name));

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)?;
            if self.domain.digest().digest(&bytes) == request.module_hash {
                return Ok(Some(path));
            }
            match CodeModule::from_bytes(&bytes) {
                Ok(module) if module.paired_hash.as_deref() == Some(&request.module_hash) => {
                    return Ok(Some(path));
                }
                Ok(_) => {}
                Err(error) => log::warn!("Ignoring unreadable module {}: {error}", path.display()),
            }
        }
        Ok(None)
    }

    fn invoke(&self, request: &Request) -> Result<ResultEnvelope> {
        let domain = &self.domain;
        let mut args = request.arguments();
        let requested =
            domain.resolve_overload(&request.type_full_name, &request.method_name, &args)?;
        let handle = self.entry_point(request, &requested, &mut args)?;

        let receiver: Option<ObjectRef> = if handle.method().is_static() {
            None
        } else {
            Some(domain.construct(&request.type_full_name)?)
        };

        let normal = request.mode == ExecutionMode::Normal;
        let mut non_locals = request.non_locals.clone();
        if normal {
            apply_non_locals(domain, &non_locals, receiver.as_ref())?;
        }

        let return_value = domain.invoke_handle(&handle, receiver.as_ref(), args)?;

        if normal {
            refresh_non_locals(domain, &mut non_locals, receiver.as_ref())?;
        } else {
            non_locals.clear();
        }

        Ok(ResultEnvelope::Completed {
            return_value,
            non_locals,
        })
    }

    /// Redirects relay and repeat methods to their relay body with the marker set.
    fn entry_point(
        &self,
        request: &Request,
        requested: &MethodHandle,
        args: &mut Vec<Value>,
    ) -> Result<MethodHandle> {
        let method = requested.method();
        let relay_entry = method.flags.contains(MethodFlags::SERVER_RELAY_ENTRY)
            || request.mode != ExecutionMode::Normal;
        let Some(relay_body) = method.relay_body.as_deref().filter(|_| relay_entry) else {
            return Ok(requested.clone());
        };

        let mut param_types = method.param_types();
        param_types.push(BOOL.to_string());
        let type_handle = self
            .domain
            .resolve_type(&TypeRef::local(request.type_full_name.clone()))?;
        let body = type_handle
            .method(relay_body, &param_types)
            .ok_or_else(|| Error::MemberNotFound {
                member: relay_body.to_string(),
                type_name: request.type_full_name.clone(),
                module: requested.module().name().to_string(),
            })?;

        args.truncate(method.params.len());
        args.push(Value::Bool(true));
        Ok(body)
    }
}

/// Serves dependency modules from the probe paths, then from the bundle embedded in the
/// executing module, extracting bundled files into the request's sandbox.
struct BundleResolver {
    module: Arc<LoadedModule>,
    probe_paths: Vec<PathBuf>,
    sandbox: PathBuf,
}

impl ModuleResolver for BundleResolver {
    fn resolve(&self, module_name: &str) -> Result<Option<Vec<u8>>> {
        if !is_plain_file_name(module_name) {
            return Ok(None);
        }
        for dir in &self.probe_paths {
            let path = dir.join(module_name);
            if path.is_file() {
                return Ok(Some(fs::read(path)?));
            }
        }

        let Some(bytes) = bundled_module(self.module.module(), module_name) else {
            return Ok(None);
        };
        let path = self.sandbox.join(module_name);
        if !path.exists() {
            fs::create_dir_all(&self.sandbox)?;
            fs::write(&path, bytes)?;
            log::info!(
                "Extracted bundled module {} from {} to {}",
                module_name,
                self.module.name(),
                path.display()
            );
        }
        Ok(Some(bytes.to_vec()))
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{MethodBuilder, TypeDef, INT32, STRING},
        remote::FaultKind,
        rewrite::ModuleProcessor,
        test::factories::{counter_module, journal_module},
        utils::DigestAlgorithm,
        variable::Variable,
    };

    struct Deployment {
        _dir: tempfile::TempDir,
        server: ExecutionServer,
        hash: String,
    }

    fn deploy(module: CodeModule) -> Deployment {
        let processed = ModuleProcessor::new().process(&module, &[]).unwrap().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("modules");
        fs::create_dir_all(&probe).unwrap();
        fs::write(
            probe.join(&processed.server.name),
            processed.server.to_bytes().unwrap(),
        )
        .unwrap();

        let server = ExecutionServer::new(
            ServerConfig::new()
                .with_probe_path(&probe)
                .with_sandbox_dir(dir.path().join("sandbox")),
        );
        let hash = DigestAlgorithm::Sha1.digest(&processed.client.to_bytes().unwrap());
        Deployment {
            _dir: dir,
            server,
            hash,
        }
    }

    fn completed(envelope: ResultEnvelope) -> (Value, Vec<Variable>) {
        match envelope {
            ResultEnvelope::Completed {
                return_value,
                non_locals,
            } => (return_value, non_locals),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_normal_mode_returns_updated_non_locals() {
        let deployment = deploy(counter_module());
        let request = Request::new(
            ExecutionMode::Normal,
            "Shop.nmod",
            &deployment.hash,
            "Shop.Counter",
            "Increment",
        )
        .with_non_locals(vec![Variable::field(
            "Shop.Counter",
            "count",
            INT32,
            Value::I32(41),
            false,
        )]);

        let (value, non_locals) = completed(deployment.server.execute(request));
        assert_eq!(value, Value::Null);
        assert_eq!(non_locals.len(), 1);
        assert_eq!(non_locals[0].value(), &Value::I32(42));
    }

    #[test]
    fn test_unknown_non_locals_are_rejected() {
        let deployment = deploy(counter_module());
        let request = |variable: Variable| {
            Request::new(
                ExecutionMode::Normal,
                "Shop.nmod",
                &deployment.hash,
                "Shop.Counter",
                "Increment",
            )
            .with_non_locals(vec![variable])
        };
        let fault = |envelope: ResultEnvelope| match envelope {
            ResultEnvelope::Fault(fault) => fault.kind,
            other => panic!("unexpected envelope {other:?}"),
        };

        let undeclared =
            Variable::field("Shop.Counter", "no_such_field", INT32, Value::I32(1), false);
        assert_eq!(
            fault(deployment.server.execute(request(undeclared))),
            FaultKind::MemberNotFound
        );

        let unnamed = Variable::field("Shop.Counter", "", INT32, Value::I32(1), false);
        assert_eq!(
            fault(deployment.server.execute(request(unnamed))),
            FaultKind::InvalidRequest
        );

        let unknown_owner = Variable::field("Ops.Journal", "count", INT32, Value::I32(1), false);
        assert_eq!(
            fault(deployment.server.execute(request(unknown_owner))),
            FaultKind::MemberNotFound
        );
    }

    #[test]
    fn test_relay_runs_body_on_server() {
        let deployment = deploy(journal_module());
        let request = Request::new(
            ExecutionMode::Relay,
            "Ops.nmod",
            &deployment.hash,
            "Ops.Journal",
            "Publish",
        )
        .with_parameters(vec![Variable::parameter(
            "message",
            STRING,
            Value::Str("deployed".into()),
        )]);

        let (_, non_locals) = completed(deployment.server.execute(request));
        assert!(non_locals.is_empty());
        assert_eq!(
            deployment
                .server
                .domain()
                .get_static("Ops.Journal", "entries")
                .unwrap(),
            Value::List(vec![Value::Str("deployed".into())])
        );
    }

    #[test]
    fn test_unknown_then_upload() {
        let module = counter_module();
        let processed = ModuleProcessor::new().process(&module, &[]).unwrap().unwrap();
        let bytes = processed.client.to_bytes().unwrap();
        let hash = DigestAlgorithm::Sha1.digest(&bytes);
        let dir = tempfile::tempdir().unwrap();
        let server = ExecutionServer::new(ServerConfig::new().with_sandbox_dir(dir.path()));

        let request = Request::new(ExecutionMode::Normal, "Shop.nmod", &hash, "Shop.Counter", "Get");
        assert_eq!(server.execute(request.clone()), ResultEnvelope::ModuleUnknown);

        let (value, _) = completed(server.execute(request.with_module_bytes(bytes)));
        assert_eq!(value, Value::I32(5));
        assert!(dir.path().join(&hash).join("Shop.nmod").is_file());
        assert_eq!(server.loaded_versions(), 1);
    }

    #[test]
    fn test_stale_module_is_a_fault() {
        let deployment = deploy(counter_module());
        let request = Request::new(
            ExecutionMode::Normal,
            "Shop.nmod",
            &deployment.hash,
            "Shop.Counter",
            "Get",
        );
        completed(deployment.server.execute(request));

        let other = DigestAlgorithm::Sha1.digest(b"a newer build");
        let request = Request::new(ExecutionMode::Normal, "Shop.nmod", other, "Shop.Counter", "Get");
        match deployment.server.execute(request) {
            ResultEnvelope::Fault(fault) => {
                assert_eq!(fault.kind, crate::remote::FaultKind::StaleModule);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_user_exception_is_reported() {
        let module = CodeModule::new("Fail.nmod").with_type(
            TypeDef::new("Fail", "Always")
                .with_method(
                    MethodBuilder::new("Run")
                        .static_method()
                        .nomadic(ExecutionMode::Normal)
                        .implementation(|asm| {
                            asm.string("boom").throw();
                        })
                        .build()
                        .unwrap(),
                )
                .with_default_constructor(),
        );
        let deployment = deploy(module);
        let request = Request::new(
            ExecutionMode::Normal,
            "Fail.nmod",
            &deployment.hash,
            "Fail.Always",
            "Run",
        );
        match deployment.server.execute(request) {
            ResultEnvelope::Fault(fault) => match fault.into_error() {
                Error::UserException { message, .. } => assert_eq!(message, "boom"),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_missing_method_is_member_not_found() {
        let deployment = deploy(counter_module());
        let request = Request::new(
            ExecutionMode::Normal,
            "Shop.nmod",
            &deployment.hash,
            "Shop.Counter",
            "Decrement",
        );
        match deployment.server.execute(request) {
            ResultEnvelope::Fault(fault) => {
                assert_eq!(fault.kind, crate::remote::FaultKind::MemberNotFound);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_main_thread_requests() {
        let module = CodeModule::new("Ui.nmod").with_type(
            TypeDef::new("Ui", "Window")
                .with_method(
                    MethodBuilder::new("Thread")
                        .static_method()
                        .nomadic(ExecutionMode::Normal)
                        .returns(STRING)
                        .implementation(|asm| {
                            asm.call(&TypeRef::local("System.Threading.Thread"), "get_Name", &[])
                                .ret();
                        })
                        .build()
                        .unwrap(),
                )
                .with_default_constructor(),
        );
        let deployment = deploy(module);
        let request = Request::new(
            ExecutionMode::Normal,
            "Ui.nmod",
            &deployment.hash,
            "Ui.Window",
            "Thread",
        )
        .on_main_thread(true);

        let (value, _) = completed(deployment.server.execute(request.clone()));
        assert_eq!(value, Value::Str(MAIN_THREAD_NAME.to_string()));
        let (again, _) = completed(deployment.server.execute(request));
        assert_eq!(again, value);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let server = ExecutionServer::new(ServerConfig::default());
        let hash = DigestAlgorithm::Sha1.digest(b"x");
        for name in ["../Shop.nmod", "dir/Shop.nmod", ".."] {
            let request = Request::new(ExecutionMode::Normal, name, &hash, "Shop.X", "Run");
            match server.execute(request) {
                ResultEnvelope::Fault(fault) => {
                    assert_eq!(fault.kind, crate::remote::FaultKind::InvalidRequest);
                }
                other => panic!("unexpected envelope {other:?}"),
            }
        }
        assert!(is_plain_file_name("Shop.nmod"));
    }
}
