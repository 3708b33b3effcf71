//! Capturing and applying non-local state.

mod common;

use common::counter_module;
use nomad::{
    analysis::{ModuleSet, ReferenceDiscoverer},
    ir::{Value, INT32},
    runtime::Domain,
    variable::{apply_non_locals, capture_non_locals, Variable},
    Error, Result,
};

#[test]
fn test_apply_is_idempotent() -> Result<()> {
    let domain = Domain::new();
    domain.load(counter_module()?)?;
    let counter = domain.construct("Shop.Counter")?;

    let variables = vec![Variable::field(
        "Shop.Counter",
        "count",
        INT32,
        Value::I32(9),
        false,
    )];
    apply_non_locals(&domain, &variables, Some(&counter))?;
    let once = counter.snapshot();
    apply_non_locals(&domain, &variables, Some(&counter))?;

    assert_eq!(counter.snapshot(), once);
    assert_eq!(counter.field("count"), Some(Value::I32(9)));
    Ok(())
}

#[test]
fn test_capture_follows_discovery() -> Result<()> {
    let module = counter_module()?;
    let type_def = module.type_def("Shop.Counter").expect("fixture type");
    let increment = type_def.method("Increment", &[]).expect("fixture method");
    let members =
        ReferenceDiscoverer::new(ModuleSet::new(&module)).discover("Shop.Counter", increment)?;
    assert!(members.has_field("Shop.Counter", "count"));

    let domain = Domain::new();
    domain.load(module.clone())?;
    let counter = domain.construct("Shop.Counter")?;
    counter.set_field("count", Value::I32(12));

    let captured = capture_non_locals(&domain, "Shop.Counter", &members, Some(&counter))?;
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].name(), "count");
    assert_eq!(captured[0].value(), &Value::I32(12));
    Ok(())
}

#[test]
fn test_parameters_do_not_copy() -> Result<()> {
    let domain = Domain::new();
    domain.load(counter_module()?)?;
    let counter = domain.construct("Shop.Counter")?;

    let parameter = Variable::parameter("amount", INT32, Value::I32(1));
    assert!(matches!(
        parameter.copy_to(&domain, Some(&counter)),
        Err(Error::InvalidOperation(_))
    ));
    Ok(())
}
