//! Non-local reference discovery.
//!
//! The [`ReferenceDiscoverer`] walks a method body and every method it can reach,
//! collecting the fields and properties of the declaring type that the walk touches.
//! That closure is exactly the execution context that has to travel with a remote
//! invocation: a method may call private helpers, reach backing fields through
//! properties, or hop through several same-type calls before touching state, so a
//! single-level scan would ship an incomplete context.
//!
//! # Boundaries
//!
//! The walk does not descend into:
//! - types in the excluded runtime namespaces (`System`, `Microsoft` by default),
//! - the execution client type, so engine internals are never treated as user code,
//! - dispatch sites installed by the rewriter.
//!
//! # Termination
//!
//! Callees are processed from a worklist and memoized by [`MethodKey`] for the duration
//! of one top-level discovery, so mutually recursive methods are each visited once.

use std::collections::{HashMap, HashSet};

use crate::{
    analysis::{MemberId, ReachableMembers},
    error::ReferenceKind,
    ir::{
        CodeModule, FieldRef, Instruction, MemberFlags, MethodDef, MethodKey, MethodRef, TypeDef,
        TypeRef,
    },
    Error, Result,
};

/// Namespaces treated as the runtime / standard library.
pub const DEFAULT_EXCLUDED_NAMESPACES: &[&str] = &["System", "Microsoft"];

/// Full name of the built-in execution client type.
pub const DEFAULT_CLIENT_TYPE: &str = "Nomad.Remote.ExecutionClient";

/// Outcome of visiting one reference during the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// The target was new and has been queued for scanning
    Continue,
    /// The target was already part of this discovery
    AlreadyVisited,
    /// The target lies behind a boundary and is not descended into
    Stop,
}

/// The code module being processed plus the dependency modules its references resolve into.
pub struct ModuleSet<'a> {
    root: &'a CodeModule,
    dependencies: HashMap<&'a str, &'a CodeModule>,
}

impl<'a> ModuleSet<'a> {
    /// A set consisting of `root` only.
    #[must_use]
    pub fn new(root: &'a CodeModule) -> Self {
        ModuleSet {
            root,
            dependencies: HashMap::new(),
        }
    }

    /// Adds a dependency module.
    #[must_use]
    pub fn with_dependency(mut self, module: &'a CodeModule) -> Self {
        self.dependencies.insert(module.name.as_str(), module);
        self
    }

    /// Adds several dependency modules.
    #[must_use]
    pub fn with_dependencies<I>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = &'a CodeModule>,
    {
        for module in modules {
            self.dependencies.insert(module.name.as_str(), module);
        }
        self
    }

    /// The module being processed.
    #[must_use]
    pub fn root(&self) -> &'a CodeModule {
        self.root
    }

    /// Looks up a dependency by name.
    #[must_use]
    pub fn dependency(&self, name: &str) -> Option<&'a CodeModule> {
        self.dependencies.get(name).copied()
    }

    /// Resolves the module a type reference found in `current` points into.
    #[must_use]
    pub fn scope(&self, current: &'a CodeModule, scope: Option<&str>) -> Option<&'a CodeModule> {
        match scope {
            None => Some(current),
            Some(name) if name == current.name => Some(current),
            Some(name) if name == self.root.name => Some(self.root),
            Some(name) => self.dependency(name),
        }
    }
}

/// A method waiting to be scanned.
struct WorkItem<'a> {
    module: &'a CodeModule,
    type_def: &'a TypeDef,
    method: &'a MethodDef,
}

/// State of one top-level discovery.
struct Walk<'a> {
    root_module: String,
    root_type: String,
    visited: HashSet<MethodKey>,
    members: ReachableMembers,
    worklist: Vec<WorkItem<'a>>,
}

impl<'a> Walk<'a> {
    fn enqueue(
        &mut self,
        module: &'a CodeModule,
        type_def: &'a TypeDef,
        method: &'a MethodDef,
    ) -> Visit {
        let key = method.key(&type_def.full_name());
        if !self.visited.insert(key.clone()) {
            return Visit::AlreadyVisited;
        }
        self.members.methods.insert(key);
        self.worklist.push(WorkItem {
            module,
            type_def,
            method,
        });
        Visit::Continue
    }

    fn note_module(&mut self, module: &CodeModule) {
        if module.name != self.root_module {
            self.members.modules.insert(module.name.clone());
        }
    }
}

/// Computes the [`ReachableMembers`] of a method.
///
/// # Examples
///
/// ```rust
/// use nomad::analysis::{ModuleSet, ReferenceDiscoverer};
/// use nomad::ir::{CodeModule, FieldDef, MethodBuilder, TypeDef, TypeRef, INT32};
///
/// let cart = TypeRef::local("Shop.Cart");
/// let total = MethodBuilder::new("Total")
///     .returns(INT32)
///     .implementation(move |asm| {
///         asm.ldthis().ldfld(&cart, "sum").ret();
///     })
///     .build()?;
/// let module = CodeModule::new("Shop.nmod").with_type(
///     TypeDef::new("Shop", "Cart")
///         .with_field(FieldDef::new("sum", INT32))
///         .with_method(total.clone()),
/// );
///
/// let discoverer = ReferenceDiscoverer::new(ModuleSet::new(&module));
/// let members = discoverer.discover("Shop.Cart", &total)?;
/// assert!(members.has_field("Shop.Cart", "sum"));
/// # Ok::<(), nomad::Error>(())
/// ```
pub struct ReferenceDiscoverer<'a> {
    modules: ModuleSet<'a>,
    client_type: String,
    excluded_namespaces: Vec<String>,
}

impl<'a> ReferenceDiscoverer<'a> {
    /// Creates a discoverer with the default client type and excluded namespaces.
    #[must_use]
    pub fn new(modules: ModuleSet<'a>) -> Self {
        ReferenceDiscoverer {
            modules,
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            excluded_namespaces: DEFAULT_EXCLUDED_NAMESPACES
                .iter()
                .map(|ns| (*ns).to_string())
                .collect(),
        }
    }

    /// Sets the execution client type at which the walk stops.
    #[must_use]
    pub fn with_client_type(mut self, client_type: &str) -> Self {
        self.client_type = client_type.to_string();
        self
    }

    /// Replaces the excluded runtime namespaces.
    #[must_use]
    pub fn with_excluded_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.excluded_namespaces = namespaces.iter().map(|ns| (*ns).to_string()).collect();
        self
    }

    /// The module set references are resolved against.
    #[must_use]
    pub fn modules(&self) -> &ModuleSet<'a> {
        &self.modules
    }

    /// Checks whether `type_name` lives in one of the excluded runtime namespaces.
    #[must_use]
    pub fn is_excluded(&self, type_name: &str) -> bool {
        self.excluded_namespaces.iter().any(|ns| {
            type_name
                .strip_prefix(ns.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Discovers the closure of `method`, declared by `type_name` in the root module.
    ///
    /// The root method itself is not part of the resulting method set; everything it
    /// calls, directly or indirectly, is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceNotFound`] if any field, property, method or type
    /// referenced along the walk cannot be resolved.
    pub fn discover(&self, type_name: &str, method: &'a MethodDef) -> Result<ReachableMembers> {
        let root = self.modules.root();
        let type_def = root
            .type_def(type_name)
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: ReferenceKind::Type,
                name: type_name.to_string(),
                owner: root.name.clone(),
                method: method.name.clone(),
            })?;

        let mut walk = Walk {
            root_module: root.name.clone(),
            root_type: type_def.full_name(),
            visited: HashSet::new(),
            members: ReachableMembers::default(),
            worklist: Vec::new(),
        };
        walk.visited.insert(method.key(type_name));
        walk.worklist.push(WorkItem {
            module: root,
            type_def,
            method,
        });

        while let Some(item) = walk.worklist.pop() {
            self.scan(&item, &mut walk)?;
        }

        log::debug!(
            "Discovered {} fields, {} properties, {} methods for {}::{}",
            walk.members.fields.len(),
            walk.members.properties.len(),
            walk.members.methods.len(),
            type_name,
            method.name
        );
        Ok(walk.members)
    }

    fn scan(&self, item: &WorkItem<'a>, walk: &mut Walk<'a>) -> Result<()> {
        let site = item.method.key(&item.type_def.full_name());
        for instruction in &item.method.body {
            match instruction {
                Instruction::LdFld(field)
                | Instruction::StFld(field)
                | Instruction::LdSFld(field)
                | Instruction::StSFld(field) => self.visit_field(item, field, &site, walk)?,
                Instruction::Call(target) => {
                    self.visit_call(item, target, &site, walk)?;
                }
                Instruction::NewObj(type_ref) => {
                    self.visit_new(item, type_ref, &site, walk)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn resolve_type(
        &self,
        current: &'a CodeModule,
        type_ref: &TypeRef,
        kind: ReferenceKind,
        member: &str,
        site: &MethodKey,
    ) -> Result<(&'a CodeModule, &'a TypeDef)> {
        self.modules
            .scope(current, type_ref.scope.as_deref())
            .and_then(|module| {
                module
                    .type_def(&type_ref.full_name)
                    .map(|type_def| (module, type_def))
            })
            .ok_or_else(|| Error::ReferenceNotFound {
                kind,
                name: member.to_string(),
                owner: type_ref.to_string(),
                method: site.to_string(),
            })
    }

    fn visit_field(
        &self,
        item: &WorkItem<'a>,
        field: &FieldRef,
        site: &MethodKey,
        walk: &mut Walk<'a>,
    ) -> Result<()> {
        if self.is_excluded(&field.owner.full_name) {
            return Ok(());
        }

        let (module, type_def) =
            self.resolve_type(item.module, &field.owner, ReferenceKind::Field, &field.name, site)?;
        let field_def = type_def
            .field(&field.name)
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: ReferenceKind::Field,
                name: field.name.clone(),
                owner: type_def.full_name(),
                method: site.to_string(),
            })?;

        walk.note_module(module);
        let owner = type_def.full_name();
        if owner == walk.root_type && !field_def.flags.contains(MemberFlags::IGNORE_TRANSFER) {
            walk.members
                .fields
                .insert(MemberId::new(owner, field_def.name.clone()));
        }
        Ok(())
    }

    fn visit_call(
        &self,
        item: &WorkItem<'a>,
        target: &MethodRef,
        site: &MethodKey,
        walk: &mut Walk<'a>,
    ) -> Result<Visit> {
        if target.owner.full_name == self.client_type || self.is_excluded(&target.owner.full_name)
        {
            return Ok(Visit::Stop);
        }

        let (module, type_def) = self.resolve_type(
            item.module,
            &target.owner,
            ReferenceKind::Method,
            &target.name,
            site,
        )?;
        let method = type_def
            .method(&target.name, &target.param_types)
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: ReferenceKind::Method,
                name: target.to_string(),
                owner: type_def.full_name(),
                method: site.to_string(),
            })?;

        if method.is_accessor() {
            if let Some(property) = type_def.property_of_accessor(&method.name) {
                if property.flags.contains(MemberFlags::IGNORE_TRANSFER) {
                    return Ok(Visit::Stop);
                }
                let owner = type_def.full_name();
                if owner == walk.root_type {
                    walk.members
                        .properties
                        .insert(MemberId::new(owner, property.name.clone()));
                }
            }
        }

        walk.note_module(module);
        Ok(walk.enqueue(module, type_def, method))
    }

    fn visit_new(
        &self,
        item: &WorkItem<'a>,
        type_ref: &TypeRef,
        site: &MethodKey,
        walk: &mut Walk<'a>,
    ) -> Result<Visit> {
        if self.is_excluded(&type_ref.full_name) {
            return Ok(Visit::Stop);
        }

        let (module, type_def) = self.resolve_type(
            item.module,
            type_ref,
            ReferenceKind::Type,
            &type_ref.full_name,
            site,
        )?;
        walk.note_module(module);
        match type_def.default_constructor() {
            Some(ctor) => Ok(walk.enqueue(module, type_def, ctor)),
            None => Ok(Visit::Stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::factories::{cart_module, ping_pong_module};

    #[test]
    fn test_closure_through_helper_and_property() {
        let module = cart_module();
        let checkout = module
            .type_def("Shop.Cart")
            .and_then(|t| t.method("Checkout", &[]))
            .unwrap();

        let members = ReferenceDiscoverer::new(ModuleSet::new(&module))
            .discover("Shop.Cart", checkout)
            .unwrap();

        assert!(members.has_field("Shop.Cart", "total"));
        assert!(members.has_field("Shop.Cart", "count"));
        assert!(members.has_property("Shop.Cart", "Count"));
        assert!(members.has_method("Shop.Cart", "Sum"));
        assert!(members.has_method("Shop.Cart", "get_Count"));
        assert!(!members.has_field("Shop.Cart", "cache"));
        assert!(!members.has_method("Shop.Cart", "Checkout"));
        assert!(members.modules.is_empty());
    }

    #[test]
    fn test_mutual_recursion_terminates() {
        let module = ping_pong_module();
        let ping = module
            .type_def("Game.Rally")
            .and_then(|t| t.method("Ping", &[]))
            .unwrap();

        let members = ReferenceDiscoverer::new(ModuleSet::new(&module))
            .discover("Game.Rally", ping)
            .unwrap();

        assert!(members.has_field("Game.Rally", "pings"));
        assert!(members.has_field("Game.Rally", "pongs"));
        assert_eq!(members.methods.len(), 1);
        assert!(members.has_method("Game.Rally", "Pong"));
    }

    #[test]
    fn test_excluded_namespaces() {
        let module = cart_module();
        let discoverer = ReferenceDiscoverer::new(ModuleSet::new(&module));
        assert!(discoverer.is_excluded("System.String"));
        assert!(discoverer.is_excluded("Microsoft.Win32.Registry"));
        assert!(!discoverer.is_excluded("SystemX.Thing"));
        assert!(!discoverer.is_excluded("Shop.Cart"));

        let discoverer = discoverer.with_excluded_namespaces(&["Shop"]);
        assert!(discoverer.is_excluded("Shop.Cart"));
    }

    #[test]
    fn test_unresolved_field_is_fatal() {
        let mut module = cart_module();
        let cart = module.type_def_mut("Shop.Cart").unwrap();
        cart.fields.retain(|f| f.name != "total");

        let module = module;
        let checkout = module
            .type_def("Shop.Cart")
            .and_then(|t| t.method("Checkout", &[]))
            .unwrap();
        let err = ReferenceDiscoverer::new(ModuleSet::new(&module))
            .discover("Shop.Cart", checkout)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ReferenceNotFound {
                kind: ReferenceKind::Field,
                ..
            }
        ));
    }
}
