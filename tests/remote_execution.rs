//! Module upload, version pinning, fault propagation and fault recovery.

mod common;

use std::sync::Arc;

use common::{cluster, counter_module, ClusterOptions};
use nomad::{
    config::ClientConfig,
    ir::{
        CodeModule, ExecutionMode, FieldDef, MethodBuilder, NomadAttribute, TypeDef, Value,
        INT32, STRING,
    },
    remote::{ExecutionClient, Failover, FaultKind, Retry},
    rewrite::ModuleProcessor,
    runtime::{Domain, MAIN_THREAD_NAME},
    utils::DigestAlgorithm,
    Error, RecoveryFailure, Result,
};

#[test]
fn test_unknown_module_is_uploaded_once() -> Result<()> {
    let options = ClusterOptions {
        deploy: false,
        ..ClusterOptions::default()
    };
    let cluster = cluster(&counter_module()?, options)?;
    let counter = cluster.domain.construct("Shop.Counter")?;

    cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])?;
    assert_eq!(counter.field("count"), Some(Value::I32(6)));
    assert_eq!(cluster.counting.exchanges(), 2);

    let hash = DigestAlgorithm::Sha1.digest(&cluster.processed.client.to_bytes()?);
    assert!(cluster
        .dir
        .path()
        .join("sandbox")
        .join(&hash)
        .join("Shop.nmod")
        .is_file());

    // The server keeps the upload; the next call needs a single exchange.
    cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])?;
    assert_eq!(counter.field("count"), Some(Value::I32(7)));
    assert_eq!(cluster.counting.exchanges(), 3);
    Ok(())
}

#[test]
fn test_second_version_is_stale() -> Result<()> {
    let cluster = cluster(&counter_module()?, ClusterOptions::default())?;
    let counter = cluster.domain.construct("Shop.Counter")?;
    cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])?;

    // Same module name and type, different content.
    let mut changed = counter_module()?;
    changed.types[0].fields[0] = FieldDef::new("count", INT32).with_initial(Value::I32(100));
    let processed = ModuleProcessor::new()
        .process(&changed, &[])?
        .expect("module declares nomadic methods");

    let domain = Domain::new();
    domain.load(processed.client)?;
    let client = Arc::new(ExecutionClient::new(
        ClientConfig::new().with_default_endpoint("node-a"),
        cluster.network.clone(),
    ));
    client.install(&domain);

    let counter = domain.construct("Shop.Counter")?;
    let err = domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])
        .unwrap_err();
    match err {
        Error::Remote(fault) => assert_eq!(fault.kind, FaultKind::StaleModule),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(counter.field("count"), Some(Value::I32(100)));
    Ok(())
}

fn failing_module() -> Result<CodeModule> {
    Ok(CodeModule::new("Fail.nmod").with_type(
        TypeDef::new("Fail", "Always")
            .with_method(
                MethodBuilder::new("Run")
                    .static_method()
                    .nomadic(ExecutionMode::Normal)
                    .implementation(|asm| {
                        asm.string("out of stock").throw();
                    })
                    .build()?,
            )
            .with_default_constructor(),
    ))
}

#[test]
fn test_user_exception_reaches_the_caller() -> Result<()> {
    let cluster = cluster(&failing_module()?, ClusterOptions::default())?;

    let err = cluster
        .domain
        .invoke_by_values("Fail.Always", "Run", None, vec![])
        .unwrap_err();
    match err {
        Error::UserException {
            type_name, message, ..
        } => {
            assert_eq!(type_name, "Fail.Always");
            assert_eq!(message, "out of stock");
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn test_main_thread_methods() -> Result<()> {
    let thread = nomad::ir::TypeRef::local("System.Threading.Thread");
    let module = CodeModule::new("Ui.nmod").with_type(
        TypeDef::new("Ui", "Window")
            .with_method(
                MethodBuilder::new("ThreadName")
                    .static_method()
                    .nomad_attribute(NomadAttribute {
                        mode: ExecutionMode::Normal,
                        run_on_main_thread: true,
                    })
                    .returns(STRING)
                    .implementation(move |asm| {
                        asm.call(&thread, "get_Name", &[]).ret();
                    })
                    .build()?,
            )
            .with_default_constructor(),
    );
    let cluster = cluster(&module, ClusterOptions::default())?;

    let name = cluster
        .domain
        .invoke_by_values("Ui.Window", "ThreadName", None, vec![])?;
    assert_eq!(name, Value::Str(MAIN_THREAD_NAME.to_string()));
    Ok(())
}

#[test]
fn test_retry_exhaustion() -> Result<()> {
    let cluster = cluster(&counter_module()?, ClusterOptions::default())?;
    let client = Arc::new(
        ExecutionClient::new(
            ClientConfig::new().with_default_endpoint("node-down"),
            cluster.counting.clone(),
        )
        .with_recoverer(Arc::new(Retry::new(3))),
    );
    client.install(&cluster.domain);

    let counter = cluster.domain.construct("Shop.Counter")?;
    let err = cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])
        .unwrap_err();
    match err {
        Error::RecoveryFailed(RecoveryFailure::Retry(errors)) => {
            assert_eq!(errors.len(), 3);
            assert!(errors.iter().all(|e| matches!(e, Error::Transport { .. })));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(counter.field("count"), Some(Value::I32(5)));
    Ok(())
}

#[test]
fn test_retry_does_not_repeat_a_thrown_call() -> Result<()> {
    let cluster = cluster(&failing_module()?, ClusterOptions::default())?;
    let client = Arc::new(
        ExecutionClient::new(
            ClientConfig::new().with_default_endpoint("node-a"),
            cluster.counting.clone(),
        )
        .with_recoverer(Arc::new(Retry::new(3))),
    );
    client.install(&cluster.domain);

    let before = cluster.counting.exchanges();
    let err = cluster
        .domain
        .invoke_by_values("Fail.Always", "Run", None, vec![])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UserException { ref message, .. } if message == "out of stock"
    ));
    assert_eq!(cluster.counting.exchanges() - before, 1);
    Ok(())
}

#[test]
fn test_failover_reaches_standby() -> Result<()> {
    let cluster = cluster(&counter_module()?, ClusterOptions::default())?;
    let client = Arc::new(
        ExecutionClient::new(
            ClientConfig::new().with_default_endpoint("node-a"),
            cluster.counting.clone(),
        )
        .with_recoverer(Arc::new(Failover::new(["node-down", "node-a"]))),
    );
    client.install(&cluster.domain);

    let counter = cluster.domain.construct("Shop.Counter")?;
    cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])?;
    assert_eq!(counter.field("count"), Some(Value::I32(6)));
    Ok(())
}

#[test]
fn test_failover_exhaustion() -> Result<()> {
    let cluster = cluster(&counter_module()?, ClusterOptions::default())?;
    let client = Arc::new(
        ExecutionClient::new(
            ClientConfig::new().with_default_endpoint("node-a"),
            cluster.counting.clone(),
        )
        .with_recoverer(Arc::new(Failover::new(["A", "B"]))),
    );
    client.install(&cluster.domain);

    let counter = cluster.domain.construct("Shop.Counter")?;
    let err = cluster
        .domain
        .invoke_by_values("Shop.Counter", "Increment", Some(&counter), vec![])
        .unwrap_err();
    match err {
        Error::RecoveryFailed(RecoveryFailure::Failover(errors)) => {
            assert_eq!(errors.keys().collect::<Vec<_>>(), ["A", "B"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}
