//! Fixtures shared by the integration tests: sample modules and an in-process
//! client/server pair.

#![allow(dead_code)]

use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use nomad::{
    config::{ClientConfig, ServerConfig},
    ir::{
        CodeModule, ExecutionMode, FieldDef, MethodBuilder, TypeDef, TypeRef, Value, INT32, LIST,
        OBJECT, STRING,
    },
    remote::{Channel, ChannelFactory, ExecutionClient, ExecutionServer, LoopbackNetwork},
    rewrite::{ModuleProcessor, ProcessedModule},
    runtime::Domain,
    Result,
};
use tempfile::TempDir;

pub const CLIENT_HOST: &str = "client-host";
pub const SERVER_HOST: &str = "server-host";

/// `Shop.nmod`: `Shop.Counter` with `count = 5` and a nomadic `Increment`.
pub fn counter_module() -> Result<CodeModule> {
    let counter = TypeRef::local("Shop.Counter");
    let increment = {
        let counter = counter.clone();
        MethodBuilder::new("Increment")
            .nomadic(ExecutionMode::Normal)
            .implementation(move |asm| {
                asm.ldthis()
                    .ldthis()
                    .ldfld(&counter, "count")
                    .constant(Value::I32(1))
                    .add()
                    .stfld(&counter, "count")
                    .ret();
            })
            .build()?
    };
    let add = MethodBuilder::new("Add")
        .nomadic(ExecutionMode::Normal)
        .param("amount", INT32)
        .returns(INT32)
        .implementation(move |asm| {
            asm.ldthis()
                .ldthis()
                .ldfld(&counter, "count")
                .ldarg(0)
                .add()
                .stfld(&counter, "count")
                .ldthis()
                .ldfld(&counter, "count")
                .ret();
        })
        .build()?;

    Ok(CodeModule::new("Shop.nmod").with_type(
        TypeDef::new("Shop", "Counter")
            .with_field(FieldDef::new("count", INT32).with_initial(Value::I32(5)))
            .with_method(increment)
            .with_method(add)
            .with_default_constructor(),
    ))
}

/// `Ops.nmod`: a static `entries` list, the relay method `Publish(message)` and the
/// repeat method `Stamp()` appending the machine name.
pub fn journal_module() -> Result<CodeModule> {
    let journal = TypeRef::local("Ops.Journal");
    let list = TypeRef::local(LIST);

    let publish = {
        let journal = journal.clone();
        let list = list.clone();
        MethodBuilder::new("Publish")
            .static_method()
            .nomadic(ExecutionMode::Relay)
            .param("message", STRING)
            .implementation(move |asm| {
                asm.ldsfld(&journal, "entries")
                    .ldarg(0)
                    .call(&list, "Append", &[LIST, OBJECT])
                    .stsfld(&journal, "entries")
                    .ret();
            })
            .build()?
    };
    let stamp = MethodBuilder::new("Stamp")
        .static_method()
        .nomadic(ExecutionMode::Repeat)
        .implementation(move |asm| {
            asm.ldsfld(&journal, "entries")
                .call(&TypeRef::local("System.Environment"), "get_MachineName", &[])
                .call(&list, "Append", &[LIST, OBJECT])
                .stsfld(&journal, "entries")
                .ret();
        })
        .build()?;

    Ok(CodeModule::new("Ops.nmod").with_type(
        TypeDef::new("Ops", "Journal")
            .with_field(
                FieldDef::new("entries", LIST)
                    .static_member()
                    .with_initial(Value::List(Vec::new())),
            )
            .with_method(publish)
            .with_method(stamp)
            .with_default_constructor(),
    ))
}

/// Wraps a channel factory and counts the exchanges made through it.
pub struct CountingNetwork {
    inner: Arc<dyn ChannelFactory>,
    exchanges: Arc<AtomicUsize>,
}

impl CountingNetwork {
    pub fn new(inner: Arc<dyn ChannelFactory>) -> Self {
        CountingNetwork {
            inner,
            exchanges: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

struct CountingChannel {
    inner: Box<dyn Channel>,
    exchanges: Arc<AtomicUsize>,
}

impl Channel for CountingChannel {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn exchange(
        &mut self,
        request: &nomad::remote::Request,
        timeout: Option<std::time::Duration>,
    ) -> Result<nomad::remote::ResultEnvelope> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.inner.exchange(request, timeout)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn abort(&mut self) {
        self.inner.abort();
    }
}

impl ChannelFactory for CountingNetwork {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Channel>> {
        Ok(Box::new(CountingChannel {
            inner: self.inner.connect(endpoint)?,
            exchanges: self.exchanges.clone(),
        }))
    }
}

/// A processed module served by one in-process server, with a client domain that has
/// the client module loaded and the execution client installed.
pub struct Cluster {
    pub dir: TempDir,
    pub processed: ProcessedModule,
    pub network: Arc<LoopbackNetwork>,
    pub counting: Arc<CountingNetwork>,
    pub server: Arc<ExecutionServer>,
    pub domain: Domain,
    pub client: Arc<ExecutionClient>,
}

pub struct ClusterOptions {
    /// Put the server module on the server's probe path
    pub deploy: bool,
    pub client: ClientConfig,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            deploy: true,
            client: ClientConfig::new()
                .with_default_endpoint("node-a")
                .with_timeout(std::time::Duration::from_secs(10)),
        }
    }
}

pub fn cluster(module: &CodeModule, options: ClusterOptions) -> Result<Cluster> {
    let processed = ModuleProcessor::new()
        .process(module, &[])?
        .expect("fixture module declares nomadic methods");

    let dir = tempfile::tempdir()?;
    let probe = dir.path().join("modules");
    fs::create_dir_all(&probe)?;
    if options.deploy {
        fs::write(probe.join(&processed.server.name), processed.server.to_bytes()?)?;
    }

    let server = Arc::new(ExecutionServer::with_domain(
        ServerConfig::new()
            .with_probe_path(&probe)
            .with_sandbox_dir(dir.path().join("sandbox")),
        Arc::new(Domain::new().with_host_name(SERVER_HOST)),
    ));
    let network = Arc::new(LoopbackNetwork::new());
    network.bind("node-a", server.clone());
    let counting = Arc::new(CountingNetwork::new(network.clone()));

    let domain = Domain::new().with_host_name(CLIENT_HOST);
    domain.load(processed.client.clone())?;
    let client = Arc::new(ExecutionClient::new(options.client, counting.clone()));
    client.install(&domain);

    Ok(Cluster {
        dir,
        processed,
        network,
        counting,
        server,
        domain,
        client,
    })
}
