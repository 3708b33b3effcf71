//! The execution client: performs the remote half of a nomadic method call.
//!
//! The client is installed as the [`Dispatcher`] for its client type. When a rewritten
//! method reaches its `dispatch` instruction, the client:
//!
//! 1. returns "not executed" straight away if dispatch is disabled, so the method runs
//!    locally,
//! 2. digests the code module declaring the method, once per module,
//! 3. snapshots the method's non-local state from the live receiver (normal mode),
//! 4. resolves the destination endpoint,
//! 5. sends the request through a [`Channel`] under the configured [`FaultRecoverer`],
//!    resending once with the module bytes when the server does not know the module,
//! 6. writes the returned non-local state back onto the receiver (normal mode).

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    analysis::DEFAULT_CLIENT_TYPE,
    config::ClientConfig,
    ir::{ExecutionMode, MethodRef, ObjectRef, Value},
    remote::{
        Channel, ChannelFactory, Direct, ExecuteServiceCallResult, FaultRecoverer, Request,
    },
    runtime::{DispatchOutcome, DispatchRequest, Dispatcher, Domain, LoadedModule},
    variable::{apply_non_locals, capture_non_locals, Variable},
    Error, Result,
};

/// One call of a nomadic method, as handed to [`ExecutionClient::execute_service_call`].
#[derive(Debug, Clone)]
pub struct ServiceCall<'a> {
    /// Execution mode of the method
    pub mode: ExecutionMode,
    /// Run on the server's main thread
    pub run_on_main_thread: bool,
    /// Explicit destination, overriding addressed parameters and the default
    pub endpoint: Option<&'a str>,
    /// The nomadic method
    pub method: &'a MethodRef,
    /// Live receiver, `None` for static methods
    pub receiver: Option<&'a ObjectRef>,
    /// Argument values in declaration order
    pub args: &'a [Value],
}

impl<'a> ServiceCall<'a> {
    /// A call of `method` in `mode` without receiver or arguments.
    #[must_use]
    pub fn new(mode: ExecutionMode, method: &'a MethodRef) -> Self {
        ServiceCall {
            mode,
            run_on_main_thread: false,
            endpoint: None,
            method,
            receiver: None,
            args: &[],
        }
    }

    /// Sets the receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver: &'a ObjectRef) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: &'a [Value]) -> Self {
        self.args = args;
        self
    }

    /// Names the destination explicitly.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &'a str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Requests the server's main thread.
    #[must_use]
    pub fn on_main_thread(mut self, main_thread: bool) -> Self {
        self.run_on_main_thread = main_thread;
        self
    }
}

/// Dispatches nomadic method calls to execution servers.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use nomad::config::ClientConfig;
/// use nomad::remote::{ExecutionClient, LoopbackNetwork, Retry};
/// use nomad::runtime::Domain;
///
/// let network = Arc::new(LoopbackNetwork::new());
/// let client = Arc::new(
///     ExecutionClient::new(ClientConfig::new().with_default_endpoint("node-a"), network)
///         .with_recoverer(Arc::new(Retry::new(3))),
/// );
/// let domain = Domain::new();
/// client.install(&domain);
/// assert!(domain.dispatcher(nomad::analysis::DEFAULT_CLIENT_TYPE).is_some());
/// ```
pub struct ExecutionClient {
    config: ClientConfig,
    channels: Arc<dyn ChannelFactory>,
    /// Module name to content digest
    digests: DashMap<String, String>,
    recoverer: Arc<dyn FaultRecoverer>,
    client_type: String,
}

impl ExecutionClient {
    /// A client sending through `channels`, without fault recovery.
    #[must_use]
    pub fn new(config: ClientConfig, channels: Arc<dyn ChannelFactory>) -> Self {
        ExecutionClient {
            config,
            channels,
            digests: DashMap::new(),
            recoverer: Arc::new(Direct),
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
        }
    }

    /// Wraps every remote invocation in `recoverer`.
    #[must_use]
    pub fn with_recoverer(mut self, recoverer: Arc<dyn FaultRecoverer>) -> Self {
        self.recoverer = recoverer;
        self
    }

    /// Serves `dispatch` sites naming `client_type` instead of the default.
    #[must_use]
    pub fn with_client_type(mut self, client_type: &str) -> Self {
        self.client_type = client_type.to_string();
        self
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The client type whose `dispatch` sites this client serves.
    #[must_use]
    pub fn client_type(&self) -> &str {
        &self.client_type
    }

    /// Installs the client as `domain`'s dispatcher for its client type.
    pub fn install(self: &Arc<Self>, domain: &Domain) {
        domain.install_dispatcher(&self.client_type, self.clone());
    }

    /// Runs `call` on a remote host.
    ///
    /// # Arguments
    ///
    /// * `domain` - The domain holding the live receiver and the method's module
    /// * `call` - The method, receiver, arguments and routing of the call
    ///
    /// # Errors
    ///
    /// - [`Error::MemberNotFound`] if the method is not loaded in `domain`
    /// - [`Error::ServerTimeout`] if no response arrived in time
    /// - [`Error::Transport`] for any other channel fault
    /// - [`Error::UserException`] if the method threw on the server
    /// - [`Error::Remote`] for other server-side failures
    /// - [`Error::RecoveryFailed`] if the configured recoverer ran out of attempts
    pub fn execute_service_call(
        &self,
        domain: &Domain,
        call: ServiceCall<'_>,
    ) -> Result<ExecuteServiceCallResult> {
        if !self.config.enabled {
            return Ok(ExecuteServiceCallResult::disabled());
        }

        let handle = domain.resolve_method(call.method)?;
        let module = handle.module().clone();
        let method = handle.method();
        let type_name = call.method.owner.full_name.as_str();

        let hash = self.module_hash(&module);

        let non_locals = match (&call.mode, &method.reachable) {
            (ExecutionMode::Normal, Some(members)) => {
                capture_non_locals(domain, type_name, members, call.receiver)?
            }
            _ => Vec::new(),
        };

        let parameters: Vec<Variable> = method
            .params
            .iter()
            .zip(call.args)
            .map(|(param, value)| Variable::parameter(&param.name, &param.type_name, value.clone()))
            .collect();

        let endpoint = self.resolve_endpoint(&call)?;

        let request = Request::new(call.mode, module.name(), hash, type_name, &call.method.name)
            .on_main_thread(call.run_on_main_thread)
            .with_parameters(parameters)
            .with_non_locals(non_locals);

        let result = self
            .recoverer
            .recover(&endpoint, &mut |target| self.attempt(target, &request, &module))?;

        if call.mode == ExecutionMode::Normal && result.is_executed() {
            apply_non_locals(domain, result.non_locals(), call.receiver)?;
        }
        Ok(result)
    }

    fn module_hash(&self, module: &LoadedModule) -> String {
        self.digests
            .entry(module.name().to_string())
            .or_insert_with(|| self.config.digest.digest(module.bytes()))
            .clone()
    }

    /// Explicit endpoint, then an addressed parameter, then the configured default.
    fn resolve_endpoint(&self, call: &ServiceCall<'_>) -> Result<String> {
        if let Some(endpoint) = call.endpoint {
            return Ok(endpoint.to_string());
        }

        if let Some(address_type) = &self.config.address_type {
            let addressed = call
                .method
                .param_types
                .iter()
                .zip(call.args)
                .find(|(declared, _)| *declared == address_type)
                .and_then(|(_, value)| value.as_str());
            if let Some(endpoint) = addressed {
                return Ok(endpoint.to_string());
            }
        }

        self.config.default_endpoint.clone().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "No endpoint for {}: none given, no addressed parameter and no default",
                call.method
            ))
        })
    }

    /// One complete invocation against `endpoint`. The channel is closed on success and
    /// aborted on failure.
    fn attempt(
        &self,
        endpoint: &str,
        request: &Request,
        module: &LoadedModule,
    ) -> Result<ExecuteServiceCallResult> {
        let mut channel = self.channels.connect(endpoint)?;
        match self.exchange(channel.as_mut(), request, module) {
            Ok(result) => {
                channel.close().map_err(|error| transport(endpoint, error))?;
                Ok(result)
            }
            Err(error) => {
                channel.abort();
                Err(error)
            }
        }
    }

    fn exchange(
        &self,
        channel: &mut dyn Channel,
        request: &Request,
        module: &LoadedModule,
    ) -> Result<ExecuteServiceCallResult> {
        let endpoint = channel.endpoint().to_string();
        let deadline = self.config.deadline();

        channel.open().map_err(|error| transport(&endpoint, error))?;
        let result = channel
            .exchange(request, deadline)
            .map_err(|error| transport(&endpoint, error))?
            .into_call_result()?;
        if !result.is_assembly_missing() {
            return Ok(result);
        }

        log::info!(
            "Uploading {} ({} bytes) to {endpoint}",
            module.name(),
            module.bytes().len()
        );
        let mut upload = request.clone().with_module_bytes(module.bytes().to_vec());
        upload.correlation_id = Uuid::new_v4();
        channel
            .exchange(&upload, deadline)
            .map_err(|error| transport(&endpoint, error))?
            .into_call_result()
    }
}

/// Keeps timeouts and transport faults, wraps everything else as a transport fault.
fn transport(endpoint: &str, error: Error) -> Error {
    match error {
        Error::ServerTimeout { .. } | Error::Transport { .. } => error,
        other => Error::Transport {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

impl Dispatcher for ExecutionClient {
    fn dispatch(&self, domain: &Domain, request: DispatchRequest<'_>) -> Result<DispatchOutcome> {
        if !self.config.enabled {
            return Ok(DispatchOutcome::NotExecuted);
        }

        let site = request.site;
        let call = ServiceCall {
            mode: site.mode,
            run_on_main_thread: site.run_on_main_thread,
            endpoint: None,
            method: &site.method,
            receiver: request.receiver,
            args: request.args,
        };
        let result = self.execute_service_call(domain, call)?;
        if !result.is_executed() {
            return Err(Error::Error(format!(
                "{} was not executed remotely: the server still lacks module after upload",
                site.method
            )));
        }
        Ok(DispatchOutcome::Executed(result.into_result()))
    }
}
