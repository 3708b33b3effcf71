//! Code modules and their type, field, property and method definitions.
//!
//! A [`CodeModule`] is the deployable unit: it is loaded, hashed and shipped between
//! hosts as a whole. Its file format is the bincode encoding produced by
//! [`CodeModule::to_bytes`]; the content digest of those bytes is the module hash
//! carried by every request.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    analysis::ReachableMembers,
    ir::{Instruction, MethodKey, MethodRef, TypeRef, Value},
    Result,
};

/// Name of instance constructors.
pub const CONSTRUCTOR_NAME: &str = ".ctor";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Module-level flags
    pub struct ModuleFlags: u32 {
        /// Every method of every type in the module is nomadic
        const NOMADIC = 0x0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Type-level flags
    pub struct TypeFlags: u32 {
        /// Every method of the type is nomadic
        const NOMADIC = 0x0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Flags shared by fields and properties
    pub struct MemberFlags: u32 {
        /// The member belongs to the type, not to instances
        const STATIC = 0x0001;
        /// The member never travels with a remote execution request
        const IGNORE_TRANSFER = 0x0002;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    /// Method flags
    pub struct MethodFlags: u32 {
        /// Static method, no receiver
        const STATIC = 0x0001;
        /// Marked nomadic
        const NOMADIC = 0x0002;
        /// Instance constructor
        const CONSTRUCTOR = 0x0004;
        /// Property getter
        const GETTER = 0x0008;
        /// Property setter
        const SETTER = 0x0010;
        /// Body moved out of a relay or repeat method by the rewriter
        const RELAY_BODY = 0x0020;
        /// Server copy: invoke the relay body with the relay marker set
        const SERVER_RELAY_ENTRY = 0x0040;
        /// Already rewritten, never rewrite twice
        const REWRITTEN = 0x0080;
    }
}

/// Policy governing where the body of a nomadic method runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum ExecutionMode {
    /// Run remotely and return the result; fall back to local execution when disabled
    #[default]
    Normal,
    /// Run only on the server; the client side is a stub
    Relay,
    /// Run on the server and then locally as well
    Repeat,
}

/// The developer marking of a nomadic method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NomadAttribute {
    /// Execution mode
    pub mode: ExecutionMode,
    /// Ask the server to run the invocation on its main thread
    pub run_on_main_thread: bool,
}

impl NomadAttribute {
    /// Attribute with the given mode, running on any server thread.
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        NomadAttribute {
            mode,
            run_on_main_thread: false,
        }
    }
}

/// A method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub type_name: String,
    /// Value used when the caller omits the argument; `Some` makes the parameter optional
    pub default: Option<Value>,
}

impl ParamDef {
    /// A required parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ParamDef {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
        }
    }

    /// An optional parameter with a default value.
    #[must_use]
    pub fn optional(name: impl Into<String>, type_name: impl Into<String>, default: Value) -> Self {
        ParamDef {
            name: name.into(),
            type_name: type_name.into(),
            default: Some(default),
        }
    }
}

/// A field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Declared type
    pub type_name: String,
    /// Static / ignore-transfer flags
    pub flags: MemberFlags,
    /// Initial value; `None` uses the type's default
    pub initial: Option<Value>,
}

impl FieldDef {
    /// An instance field.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            type_name: type_name.into(),
            flags: MemberFlags::empty(),
            initial: None,
        }
    }

    /// Marks the field static.
    #[must_use]
    pub fn static_member(mut self) -> Self {
        self.flags |= MemberFlags::STATIC;
        self
    }

    /// Excludes the field from remote transfer.
    #[must_use]
    pub fn ignore_transfer(mut self) -> Self {
        self.flags |= MemberFlags::IGNORE_TRANSFER;
        self
    }

    /// Sets the initial value.
    #[must_use]
    pub fn with_initial(mut self, value: Value) -> Self {
        self.initial = Some(value);
        self
    }

    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MemberFlags::STATIC)
    }

    /// The value a fresh instance (or type) starts with.
    #[must_use]
    pub fn initial_value(&self) -> Value {
        self.initial
            .clone()
            .unwrap_or_else(|| Value::default_for(&self.type_name))
    }
}

/// A property definition, backed by accessor methods of the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name
    pub name: String,
    /// Declared type
    pub type_name: String,
    /// Static / ignore-transfer flags
    pub flags: MemberFlags,
    /// Name of the getter method
    pub getter: Option<String>,
    /// Name of the setter method
    pub setter: Option<String>,
}

impl PropertyDef {
    /// A property without accessors.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        PropertyDef {
            name: name.into(),
            type_name: type_name.into(),
            flags: MemberFlags::empty(),
            getter: None,
            setter: None,
        }
    }

    /// Sets the getter method name.
    #[must_use]
    pub fn with_getter(mut self, method: impl Into<String>) -> Self {
        self.getter = Some(method.into());
        self
    }

    /// Sets the setter method name.
    #[must_use]
    pub fn with_setter(mut self, method: impl Into<String>) -> Self {
        self.setter = Some(method.into());
        self
    }

    /// Marks the property static.
    #[must_use]
    pub fn static_member(mut self) -> Self {
        self.flags |= MemberFlags::STATIC;
        self
    }

    /// Excludes the property from remote transfer.
    #[must_use]
    pub fn ignore_transfer(mut self) -> Self {
        self.flags |= MemberFlags::IGNORE_TRANSFER;
        self
    }

    /// Returns `true` for static properties.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MemberFlags::STATIC)
    }

    /// Returns `true` if `method` is one of this property's accessors.
    #[must_use]
    pub fn has_accessor(&self, method: &str) -> bool {
        self.getter.as_deref() == Some(method) || self.setter.as_deref() == Some(method)
    }
}

/// A method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Method flags
    pub flags: MethodFlags,
    /// Parameters, excluding the receiver
    pub params: Vec<ParamDef>,
    /// Return type, `None` for void
    pub return_type: Option<String>,
    /// Number of local slots
    pub locals: u16,
    /// The body
    pub body: Vec<Instruction>,
    /// Nomadic marking
    pub nomad: Option<NomadAttribute>,
    /// For rewritten relay / repeat methods: the sibling holding the original body
    pub relay_body: Option<String>,
    /// Closure of state the method touches, recorded by the rewriter
    pub reachable: Option<ReachableMembers>,
}

impl MethodDef {
    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns `true` for methods returning nothing.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.return_type.is_none()
    }

    /// Returns `true` for the parameterless instance constructor.
    #[must_use]
    pub fn is_default_constructor(&self) -> bool {
        self.flags.contains(MethodFlags::CONSTRUCTOR) && !self.is_static() && self.params.is_empty()
    }

    /// Returns `true` for property accessors.
    #[must_use]
    pub fn is_accessor(&self) -> bool {
        self.flags.intersects(MethodFlags::GETTER | MethodFlags::SETTER)
    }

    /// Returns the declared parameter types.
    #[must_use]
    pub fn param_types(&self) -> Vec<String> {
        self.params.iter().map(|p| p.type_name.clone()).collect()
    }

    /// Checks whether the method's signature matches `param_types` exactly.
    #[must_use]
    pub fn has_signature(&self, param_types: &[String]) -> bool {
        self.params.len() == param_types.len()
            && self
                .params
                .iter()
                .zip(param_types)
                .all(|(param, ty)| &param.type_name == ty)
    }

    /// The identity of this method when declared by `type_name`.
    #[must_use]
    pub fn key(&self, type_name: &str) -> MethodKey {
        MethodKey {
            type_name: type_name.to_string(),
            name: self.name.clone(),
            param_types: self.param_types(),
        }
    }

    /// A reference to this method when declared by `owner`.
    #[must_use]
    pub fn reference(&self, owner: TypeRef) -> MethodRef {
        MethodRef {
            owner,
            name: self.name.clone(),
            param_types: self.param_types(),
        }
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Namespace, empty for the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Type flags
    pub flags: TypeFlags,
    /// Fields
    pub fields: Vec<FieldDef>,
    /// Properties
    pub properties: Vec<PropertyDef>,
    /// Methods, including constructors and accessors
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    /// An empty type.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        TypeDef {
            namespace: namespace.into(),
            name: name.into(),
            flags: TypeFlags::empty(),
            fields: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Namespace-qualified name.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Marks every method of the type nomadic.
    #[must_use]
    pub fn nomadic(mut self) -> Self {
        self.flags |= TypeFlags::NOMADIC;
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Adds a method.
    #[must_use]
    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Adds an empty parameterless constructor.
    #[must_use]
    pub fn with_default_constructor(mut self) -> Self {
        self.methods.push(MethodDef {
            name: CONSTRUCTOR_NAME.to_string(),
            flags: MethodFlags::CONSTRUCTOR,
            params: Vec::new(),
            return_type: None,
            locals: 0,
            body: vec![Instruction::Ret],
            nomad: None,
            relay_body: None,
            reachable: None,
        });
        self
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Finds the property that `method` is an accessor of.
    #[must_use]
    pub fn property_of_accessor(&self, method: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.has_accessor(method))
    }

    /// Looks up a method by name and exact parameter types.
    #[must_use]
    pub fn method(&self, name: &str, param_types: &[String]) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.has_signature(param_types))
    }

    /// Mutable lookup by name and exact parameter types.
    pub fn method_mut(&mut self, name: &str, param_types: &[String]) -> Option<&mut MethodDef> {
        self.methods
            .iter_mut()
            .find(|m| m.name == name && m.has_signature(param_types))
    }

    /// All overloads named `name`.
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDef> + 'a {
        self.methods.iter().filter(move |m| m.name == name)
    }

    /// The parameterless instance constructor, if declared.
    #[must_use]
    pub fn default_constructor(&self) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.is_default_constructor())
    }
}

/// A deployable unit of types and methods.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{CodeModule, FieldDef, TypeDef, INT32};
///
/// let module = CodeModule::new("Shop.nmod").with_type(
///     TypeDef::new("Shop", "Counter")
///         .with_field(FieldDef::new("count", INT32))
///         .with_default_constructor(),
/// );
/// let bytes = module.to_bytes()?;
/// assert_eq!(CodeModule::from_bytes(&bytes)?, module);
/// # Ok::<(), nomad::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeModule {
    /// Module file name, e.g. `Shop.nmod`
    pub name: String,
    /// Module flags
    pub flags: ModuleFlags,
    /// Names of the modules this one references
    pub references: Vec<String>,
    /// Types defined by the module
    pub types: Vec<TypeDef>,
    /// Embedded resources, including the dependency bundle
    pub resources: BTreeMap<String, Vec<u8>>,
    /// For server copies: hash of the client module this copy was produced with
    pub paired_hash: Option<String>,
}

impl CodeModule {
    /// An empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        CodeModule {
            name: name.into(),
            flags: ModuleFlags::empty(),
            references: Vec::new(),
            types: Vec::new(),
            resources: BTreeMap::new(),
            paired_hash: None,
        }
    }

    /// Marks every method of the module nomadic.
    #[must_use]
    pub fn nomadic(mut self) -> Self {
        self.flags |= ModuleFlags::NOMADIC;
        self
    }

    /// Adds a type.
    #[must_use]
    pub fn with_type(mut self, type_def: TypeDef) -> Self {
        self.types.push(type_def);
        self
    }

    /// Adds a module reference.
    #[must_use]
    pub fn with_reference(mut self, module: impl Into<String>) -> Self {
        self.references.push(module.into());
        self
    }

    /// Decodes a module file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Codec`] for undecodable input and [`crate::Error::Malformed`]
    /// if the decoded module is structurally invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(malformed_error!("Empty module file"));
        }
        let module: CodeModule = bincode::deserialize(data)?;
        module.validate()?;
        Ok(module)
    }

    /// Encodes the module file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Codec`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Checks structural invariants: named module and types, unique type names,
    /// branch targets inside their bodies.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(malformed_error!("Module without a name"));
        }

        let mut seen = std::collections::HashSet::new();
        for type_def in &self.types {
            let full_name = type_def.full_name();
            if type_def.name.is_empty() {
                return Err(malformed_error!("Unnamed type in module '{}'", self.name));
            }
            if !seen.insert(full_name.clone()) {
                return Err(malformed_error!(
                    "Duplicate type '{}' in module '{}'",
                    full_name,
                    self.name
                ));
            }

            for method in &type_def.methods {
                let len = method.body.len();
                for (index, instruction) in method.body.iter().enumerate() {
                    if let Some(target) = instruction.branch_target() {
                        if target >= len {
                            return Err(malformed_error!(
                                "Branch at IL_{:04} of '{}::{}' targets IL_{:04} outside a body of {} instructions",
                                index,
                                full_name,
                                method.name,
                                target,
                                len
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up a type by full name.
    #[must_use]
    pub fn type_def(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name() == full_name)
    }

    /// Mutable lookup of a type by full name.
    pub fn type_def_mut(&mut self, full_name: &str) -> Option<&mut TypeDef> {
        self.types.iter_mut().find(|t| t.full_name() == full_name)
    }

    /// Resolves a method key against this module.
    #[must_use]
    pub fn method(&self, key: &MethodKey) -> Option<(&TypeDef, &MethodDef)> {
        let type_def = self.type_def(&key.type_name)?;
        let method = type_def.method(&key.name, &key.param_types)?;
        Some((type_def, method))
    }

    /// Returns `true` if `method` of `type_def` is marked nomadic directly or through its
    /// type or module.
    #[must_use]
    pub fn is_nomadic(&self, type_def: &TypeDef, method: &MethodDef) -> bool {
        if method.flags.intersects(
            MethodFlags::CONSTRUCTOR
                | MethodFlags::GETTER
                | MethodFlags::SETTER
                | MethodFlags::RELAY_BODY,
        ) {
            return false;
        }
        method.nomad.is_some()
            || method.flags.contains(MethodFlags::NOMADIC)
            || type_def.flags.contains(TypeFlags::NOMADIC)
            || self.flags.contains(ModuleFlags::NOMADIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::INT32;

    fn counter() -> TypeDef {
        TypeDef::new("Shop", "Counter")
            .with_field(FieldDef::new("count", INT32))
            .with_property(
                PropertyDef::new("Count", INT32)
                    .with_getter("get_Count")
                    .with_setter("set_Count"),
            )
            .with_default_constructor()
    }

    #[test]
    fn test_type_lookups() {
        let counter = counter();
        assert_eq!(counter.full_name(), "Shop.Counter");
        assert!(counter.field("count").is_some());
        assert_eq!(
            counter.property_of_accessor("set_Count").map(|p| p.name.as_str()),
            Some("Count")
        );
        assert!(counter.default_constructor().is_some());
        assert!(counter.method(CONSTRUCTOR_NAME, &[]).is_some());
    }

    #[test]
    fn test_field_initial_value() {
        assert_eq!(FieldDef::new("n", INT32).initial_value(), Value::I32(0));
        assert_eq!(
            FieldDef::new("n", INT32)
                .with_initial(Value::I32(4))
                .initial_value(),
            Value::I32(4)
        );
        assert!(FieldDef::new("n", INT32).static_member().is_static());
    }

    #[test]
    fn test_validate_rejects_bad_branch() {
        let mut counter = counter();
        counter.methods[0].body = vec![Instruction::Br(5), Instruction::Ret];
        let module = CodeModule::new("Shop.nmod").with_type(counter);
        assert!(matches!(
            module.validate(),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_types() {
        let module = CodeModule::new("Shop.nmod")
            .with_type(counter())
            .with_type(counter());
        assert!(module.validate().is_err());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(CodeModule::from_bytes(&[]).is_err());
        assert!(CodeModule::from_bytes(&[0xFF, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_execution_mode_text() {
        assert_eq!(ExecutionMode::Relay.to_string(), "Relay");
        assert_eq!(
            "Repeat".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Repeat
        );
        assert!("Sideways".parse::<ExecutionMode>().is_err());
    }
}
