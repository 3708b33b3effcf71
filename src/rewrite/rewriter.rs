//! Rewriting of single nomadic methods.
//!
//! The rewriter turns a marked method into a call site that first offers the invocation
//! to an execution client through a `dispatch` instruction. The resulting bodies, with
//! `n` the number of declared parameters and `body'` the original body with its branch
//! targets shifted past the inserted prefix:
//!
//! ```text
//! Normal, non-void        Normal, void
//!   0: dispatch             0: dispatch
//!   1: brfalse 3            1: brfalse 4
//!   2: ret                  2: pop
//!   3: pop                  3: ret
//!   4: body'                4: pop
//!                           5: body'
//! ```
//!
//! Relay and repeat methods keep their signature but delegate to a sibling method that
//! receives the original body plus a trailing optional relay marker:
//!
//! ```text
//! M(a0..an-1)               M$relay(a0..an-1, marker = false)
//!   ldarg 0 .. ldarg n-1      0: ldarg n
//!   const false               1: brtrue k
//!   call M$relay              2: dispatch
//!   ret                       3: pop
//!                             4: pop
//!                             5: ret        (relay only)
//!                             k: body'
//! ```
//!
//! The server invokes the sibling with the marker set, which skips the dispatch prefix.

use crate::{
    analysis::ReachableMembers,
    ir::{
        DispatchSite, ExecutionMode, Instruction, MethodDef, MethodFlags, NomadAttribute,
        ParamDef, TypeDef, TypeRef, Value, BOOL,
    },
    Error, Result,
};

/// Name of the trailing parameter appended to relay bodies.
pub const RELAY_MARKER_PARAM: &str = "<nomad>relay";

/// Name of the sibling method receiving the body of relay or repeat method `name`.
#[must_use]
pub fn relay_body_name(name: &str) -> String {
    format!("{name}$relay")
}

/// What was done to one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenMethod {
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub method: String,
    /// Mode the method was rewritten for
    pub mode: ExecutionMode,
    /// Name of the generated relay body, for relay and repeat methods
    pub relay_body: Option<String>,
}

/// Installs dispatch prefixes and relay stubs on nomadic methods.
///
/// The rewriter is stateless apart from the execution client type that every installed
/// site names. It operates on one type definition at a time so callers can rewrite a
/// clone of a module and discard it if any method fails.
#[derive(Debug, Clone)]
pub struct MethodRewriter {
    client: TypeRef,
}

impl MethodRewriter {
    /// Creates a rewriter whose dispatch sites name `client_type`.
    #[must_use]
    pub fn new(client_type: &str) -> Self {
        MethodRewriter {
            client: TypeRef::local(client_type),
        }
    }

    /// Type of the execution client named by installed sites.
    #[must_use]
    pub fn client(&self) -> &TypeRef {
        &self.client
    }

    /// Checks that `method` of `type_def` can be rewritten under `attribute`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidNomadMethod`] if the method was already rewritten, if the
    /// declaring type lacks a parameterless constructor, if a relay or repeat method is
    /// not static or returns a value, or if the relay body name is taken.
    pub fn check(
        &self,
        module: &str,
        type_def: &TypeDef,
        method: &MethodDef,
        attribute: NomadAttribute,
    ) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidNomadMethod {
            method: format!("{}::{}", type_def.full_name(), method.name),
            module: module.to_string(),
            reason: reason.to_string(),
        };

        if method.flags.contains(MethodFlags::REWRITTEN) {
            return Err(invalid("method was already rewritten"));
        }
        if type_def.default_constructor().is_none() {
            return Err(invalid("declaring type has no parameterless constructor"));
        }
        if u16::try_from(method.params.len()).is_err() {
            return Err(invalid("too many parameters"));
        }

        if attribute.mode != ExecutionMode::Normal {
            if !method.is_static() {
                return Err(invalid(&format!(
                    "{} methods must be static",
                    attribute.mode
                )));
            }
            if !method.is_void() {
                return Err(invalid(&format!(
                    "{} methods must not return a value",
                    attribute.mode
                )));
            }
            let sibling = relay_body_name(&method.name);
            if type_def.methods_named(&sibling).next().is_some() {
                return Err(invalid(&format!("a method named '{sibling}' already exists")));
            }
        }
        Ok(())
    }

    /// Rewrites method `index` of `type_def` and records `reachable` on it.
    ///
    /// # Arguments
    ///
    /// * `module` - Name of the module declaring the type, used in errors
    /// * `type_def` - Declaring type, modified in place
    /// * `index` - Index of the method within `type_def.methods`
    /// * `attribute` - Mode and threading requested by the marking
    /// * `reachable` - Closure discovered for the method
    ///
    /// # Errors
    ///
    /// As [`Self::check`]; the type is left untouched on error.
    pub fn rewrite(
        &self,
        module: &str,
        type_def: &mut TypeDef,
        index: usize,
        attribute: NomadAttribute,
        reachable: ReachableMembers,
    ) -> Result<RewrittenMethod> {
        let type_name = type_def.full_name();
        let method = type_def.methods.get(index).ok_or_else(|| {
            Error::Error(format!("Method index {index} out of range on '{type_name}'"))
        })?;
        self.check(module, type_def, method, attribute)?;
        let param_count = u16::try_from(method.params.len())
            .map_err(|_| Error::Error(format!("Too many parameters on '{type_name}'")))?;

        let site = DispatchSite {
            client: self.client.clone(),
            mode: attribute.mode,
            run_on_main_thread: attribute.run_on_main_thread,
            method: method.reference(TypeRef::local(type_name.clone())),
            param_count,
        };

        let relay_body = match attribute.mode {
            ExecutionMode::Normal => {
                let method = &mut type_def.methods[index];
                install_prefix(method, site);
                None
            }
            ExecutionMode::Relay | ExecutionMode::Repeat => {
                let sibling = split_relay_body(&type_name, &mut type_def.methods[index], site);
                let name = sibling.name.clone();
                type_def.methods.push(sibling);
                Some(name)
            }
        };

        let method = &mut type_def.methods[index];
        method.flags |= MethodFlags::REWRITTEN;
        method.nomad = Some(attribute);
        method.reachable = Some(reachable);

        log::debug!(
            "Rewrote {}::{} for {} execution",
            type_name,
            method.name,
            attribute.mode
        );

        Ok(RewrittenMethod {
            type_name,
            method: method.name.clone(),
            mode: attribute.mode,
            relay_body,
        })
    }
}

/// Shifts every branch target of `body` by `offset`.
fn shift_branches(body: &mut [Instruction], offset: usize) {
    for instruction in body.iter_mut() {
        if let Some(target) = instruction.branch_target_mut() {
            *target += offset;
        }
    }
}

/// Prepends `prefix` to the body of `method`.
fn prepend(method: &mut MethodDef, mut prefix: Vec<Instruction>) {
    let mut body = std::mem::take(&mut method.body);
    shift_branches(&mut body, prefix.len());
    prefix.append(&mut body);
    method.body = prefix;
}

fn install_prefix(method: &mut MethodDef, site: DispatchSite) {
    let prefix = if method.is_void() {
        vec![
            Instruction::Dispatch(site),
            Instruction::BrFalse(4),
            Instruction::Pop,
            Instruction::Ret,
            Instruction::Pop,
        ]
    } else {
        vec![
            Instruction::Dispatch(site),
            Instruction::BrFalse(3),
            Instruction::Ret,
            Instruction::Pop,
        ]
    };
    prepend(method, prefix);
}

/// Moves the body of `method` into a new sibling and turns `method` into a forwarding
/// stub. Returns the sibling.
fn split_relay_body(type_name: &str, method: &mut MethodDef, site: DispatchSite) -> MethodDef {
    let repeat = site.mode == ExecutionMode::Repeat;
    let marker = site.param_count;

    let mut sibling = method.clone();
    sibling.name = relay_body_name(&method.name);
    sibling.flags |= MethodFlags::RELAY_BODY | MethodFlags::REWRITTEN;
    sibling.flags.remove(MethodFlags::NOMADIC);
    sibling.nomad = None;
    sibling.relay_body = None;
    sibling.reachable = None;
    sibling
        .params
        .push(ParamDef::optional(RELAY_MARKER_PARAM, BOOL, Value::Bool(false)));

    let body_start = if repeat { 5 } else { 6 };
    let mut prefix = vec![
        Instruction::LdArg(marker),
        Instruction::BrTrue(body_start),
        Instruction::Dispatch(site),
        Instruction::Pop,
        Instruction::Pop,
    ];
    if !repeat {
        prefix.push(Instruction::Ret);
    }
    prepend(&mut sibling, prefix);

    let mut stub: Vec<Instruction> = (0..marker).map(Instruction::LdArg).collect();
    stub.push(Instruction::Const(Value::Bool(false)));
    stub.push(Instruction::Call(
        sibling.reference(TypeRef::local(type_name)),
    ));
    stub.push(Instruction::Ret);

    method.body = stub;
    method.locals = 0;
    method.relay_body = Some(sibling.name.clone());
    sibling
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        analysis::DEFAULT_CLIENT_TYPE,
        ir::{CodeModule, MethodBuilder, TypeDef, INT32, STRING},
        runtime::{DispatchOutcome, DispatchRequest, Dispatcher, Domain},
        test::factories::{counter_module, journal_module},
    };

    /// Counts dispatches and answers with a fixed outcome.
    struct Stub {
        calls: AtomicUsize,
        outcome: DispatchOutcome,
    }

    impl Stub {
        fn install(domain: &Domain, outcome: DispatchOutcome) -> Arc<Stub> {
            let stub = Arc::new(Stub {
                calls: AtomicUsize::new(0),
                outcome,
            });
            domain.install_dispatcher(DEFAULT_CLIENT_TYPE, stub.clone());
            stub
        }
    }

    impl Dispatcher for Stub {
        fn dispatch(&self, _domain: &Domain, request: DispatchRequest<'_>) -> Result<DispatchOutcome> {
            assert_eq!(request.args.len(), usize::from(request.site.param_count));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    fn rewrite_all(mut module: CodeModule) -> CodeModule {
        let rewriter = MethodRewriter::new(DEFAULT_CLIENT_TYPE);
        let name = module.name.clone();
        for type_def in &mut module.types {
            let marked: Vec<(usize, NomadAttribute)> = type_def
                .methods
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.nomad.map(|a| (i, a)))
                .collect();
            for (index, attribute) in marked {
                rewriter
                    .rewrite(&name, type_def, index, attribute, ReachableMembers::default())
                    .unwrap();
            }
        }
        module
    }

    fn entries(domain: &Domain) -> Vec<Value> {
        match domain.get_static("Ops.Journal", "entries").unwrap() {
            Value::List(items) => items,
            other => panic!("unexpected entries {other:?}"),
        }
    }

    #[test]
    fn test_normal_prefix_shape() {
        let module = rewrite_all(counter_module());
        let counter = module.type_def("Shop.Counter").unwrap();
        let increment = counter.method("Increment", &[]).unwrap();

        assert!(matches!(increment.body[0], Instruction::Dispatch(_)));
        assert_eq!(increment.body[1], Instruction::BrFalse(4));
        assert_eq!(increment.body[3], Instruction::Ret);
        assert!(increment.flags.contains(MethodFlags::REWRITTEN));
        assert!(increment.reachable.is_some());
        assert!(module.validate().is_ok());
    }

    #[test]
    fn test_normal_executed_returns_remote_value() {
        let module = CodeModule::new("Calc.nmod").with_type(
            TypeDef::new("Calc", "Ops")
                .with_method(
                    MethodBuilder::new("Twice")
                        .static_method()
                        .nomadic(ExecutionMode::Normal)
                        .param("x", INT32)
                        .returns(INT32)
                        .implementation(|asm| {
                            asm.ldarg(0)
                                .ldarg(0)
                                .add()
                                .ret();
                        })
                        .build()
                        .unwrap(),
                )
                .with_default_constructor(),
        );
        let domain = Domain::new();
        domain.load(rewrite_all(module)).unwrap();

        let local = domain
            .invoke_by_values("Calc.Ops", "Twice", None, vec![Value::I32(4)])
            .unwrap();
        assert_eq!(local, Value::I32(8));

        let stub = Stub::install(&domain, DispatchOutcome::Executed(Value::I32(99)));
        let remote = domain
            .invoke_by_values("Calc.Ops", "Twice", None, vec![Value::I32(4)])
            .unwrap();
        assert_eq!(remote, Value::I32(99));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_normal_void_runs_locally_only_when_not_executed() {
        let domain = Domain::new();
        domain.load(rewrite_all(counter_module())).unwrap();
        let counter = domain.construct("Shop.Counter").unwrap();

        domain
            .invoke_by_values("Shop.Counter", "Increment", Some(&counter), Vec::new())
            .unwrap();
        assert_eq!(counter.field("count"), Some(Value::I32(6)));

        let stub = Stub::install(&domain, DispatchOutcome::Executed(Value::Null));
        domain
            .invoke_by_values("Shop.Counter", "Increment", Some(&counter), Vec::new())
            .unwrap();
        assert_eq!(counter.field("count"), Some(Value::I32(6)));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relay_stub_skips_local_body() {
        let module = rewrite_all(journal_module());
        let journal = module.type_def("Ops.Journal").unwrap();
        let publish = journal.method("Publish", &[STRING.to_string()]).unwrap();
        assert_eq!(publish.relay_body.as_deref(), Some("Publish$relay"));
        let sibling = journal
            .method("Publish$relay", &[STRING.to_string(), BOOL.to_string()])
            .unwrap();
        assert!(sibling.flags.contains(MethodFlags::RELAY_BODY));
        assert!(!module.is_nomadic(journal, sibling));

        let domain = Domain::new();
        domain.load(module).unwrap();
        let stub = Stub::install(&domain, DispatchOutcome::Executed(Value::Null));

        domain
            .invoke_by_values(
                "Ops.Journal",
                "Publish",
                None,
                vec![Value::Str("hello".into())],
            )
            .unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert!(entries(&domain).is_empty());
    }

    #[test]
    fn test_relay_marker_runs_body() {
        let domain = Domain::new();
        domain.load(rewrite_all(journal_module())).unwrap();
        let stub = Stub::install(&domain, DispatchOutcome::Executed(Value::Null));

        domain
            .invoke_by_values(
                "Ops.Journal",
                "Publish$relay",
                None,
                vec![Value::Str("hello".into()), Value::Bool(true)],
            )
            .unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entries(&domain), vec![Value::Str("hello".into())]);
    }

    #[test]
    fn test_repeat_runs_locally_after_dispatch() {
        let domain = Domain::new().with_host_name("client-host");
        domain.load(rewrite_all(journal_module())).unwrap();
        let stub = Stub::install(&domain, DispatchOutcome::Executed(Value::Null));

        domain
            .invoke_by_values("Ops.Journal", "Stamp", None, Vec::new())
            .unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&domain), vec![Value::Str("client-host".into())]);
    }

    #[test]
    fn test_preconditions() {
        let rewriter = MethodRewriter::new(DEFAULT_CLIENT_TYPE);

        let mut counter = counter_module().types.remove(0);
        let increment = counter
            .methods
            .iter()
            .position(|m| m.name == "Increment")
            .unwrap();
        let err = rewriter
            .rewrite(
                "Shop.nmod",
                &mut counter,
                increment,
                NomadAttribute::new(ExecutionMode::Relay),
                ReachableMembers::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNomadMethod { .. }));

        let mut no_ctor = TypeDef::new("Shop", "Bare")
            .with_method(MethodBuilder::new("Run").build().unwrap());
        let err = rewriter
            .rewrite(
                "Shop.nmod",
                &mut no_ctor,
                0,
                NomadAttribute::default(),
                ReachableMembers::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("parameterless constructor"));
        assert_eq!(no_ctor.methods[0].body, vec![Instruction::Ret]);
    }

    #[test]
    fn test_never_rewrites_twice() {
        let module = rewrite_all(counter_module());
        let mut counter = module.types[0].clone();
        let index = counter
            .methods
            .iter()
            .position(|m| m.name == "Increment")
            .unwrap();
        let rewriter = MethodRewriter::new(DEFAULT_CLIENT_TYPE);
        assert!(rewriter
            .rewrite(
                "Shop.nmod",
                &mut counter,
                index,
                NomadAttribute::default(),
                ReachableMembers::default(),
            )
            .is_err());
    }

    #[test]
    fn test_branches_shift_past_prefix() {
        let mut method = MethodBuilder::new("Loop")
            .returns(INT32)
            .implementation(|asm| {
                asm.label("top").ldarg(0).brtrue("top").constant(Value::I32(1)).ret();
            })
            .build()
            .unwrap();
        method.params.push(ParamDef::new("flag", BOOL));
        let mut type_def = TypeDef::new("Shop", "Loops")
            .with_method(method)
            .with_default_constructor();
        MethodRewriter::new(DEFAULT_CLIENT_TYPE)
            .rewrite(
                "Shop.nmod",
                &mut type_def,
                0,
                NomadAttribute::default(),
                ReachableMembers::default(),
            )
            .unwrap();
        assert_eq!(type_def.methods[0].body[5], Instruction::BrTrue(4));
    }
}
