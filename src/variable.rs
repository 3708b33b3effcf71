//! Typed name/value records that carry state across a remote invocation.
//!
//! A [`Variable`] is created fresh for each request or response and discarded once it
//! has been applied. Field and property variables can read their value from, and write
//! it onto, a live instance (or the type, for static members). Parameter variables have
//! the same shape but are one-way inputs: asking them to copy is an invalid operation.

use serde::{Deserialize, Serialize};

use crate::{
    analysis::ReachableMembers,
    error::ReferenceKind,
    ir::{MethodRef, ObjectRef, TypeRef, Value},
    runtime::{Domain, TypeHandle},
    Error, Result,
};

/// The data shared by every kind of [`Variable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableData {
    /// Member or parameter name, never empty
    pub name: String,
    /// Full name of the declaring type; empty for parameters
    pub owner: String,
    /// Declared type name
    pub declared_type: String,
    /// Current value
    pub value: Value,
    /// Whether the member belongs to the type rather than an instance
    pub is_static: bool,
}

/// A typed name/value record.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{Value, INT32};
/// use nomad::variable::Variable;
///
/// let p = Variable::parameter("count", INT32, Value::I32(3));
/// assert_eq!(p.name(), "count");
/// assert!(p.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// A field, copied by direct field access
    Field(VariableData),
    /// A property, copied through its accessor methods
    Property(VariableData),
    /// A method parameter, never copied back
    Parameter(VariableData),
}

impl Variable {
    /// A field variable.
    #[must_use]
    pub fn field(
        owner: impl Into<String>,
        name: impl Into<String>,
        declared_type: impl Into<String>,
        value: Value,
        is_static: bool,
    ) -> Self {
        Variable::Field(VariableData {
            name: name.into(),
            owner: owner.into(),
            declared_type: declared_type.into(),
            value,
            is_static,
        })
    }

    /// A property variable.
    #[must_use]
    pub fn property(
        owner: impl Into<String>,
        name: impl Into<String>,
        declared_type: impl Into<String>,
        value: Value,
        is_static: bool,
    ) -> Self {
        Variable::Property(VariableData {
            name: name.into(),
            owner: owner.into(),
            declared_type: declared_type.into(),
            value,
            is_static,
        })
    }

    /// A parameter variable.
    #[must_use]
    pub fn parameter(name: impl Into<String>, declared_type: impl Into<String>, value: Value) -> Self {
        Variable::Parameter(VariableData {
            name: name.into(),
            owner: String::new(),
            declared_type: declared_type.into(),
            value,
            is_static: false,
        })
    }

    /// The shared data.
    #[must_use]
    pub fn data(&self) -> &VariableData {
        match self {
            Variable::Field(data) | Variable::Property(data) | Variable::Parameter(data) => data,
        }
    }

    fn data_mut(&mut self) -> &mut VariableData {
        match self {
            Variable::Field(data) | Variable::Property(data) | Variable::Parameter(data) => data,
        }
    }

    /// Variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.data().name
    }

    /// Declared type name.
    #[must_use]
    pub fn declared_type(&self) -> &str {
        &self.data().declared_type
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.data().value
    }

    /// Consumes the variable, returning its value.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Variable::Field(data) | Variable::Property(data) | Variable::Parameter(data) => {
                data.value
            }
        }
    }

    /// Whether the variable names a static member.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.data().is_static
    }

    /// Checks the invariants of a received variable: a non-empty name and declared type,
    /// and an owner for members.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] describing the violation.
    pub fn validate(&self) -> Result<()> {
        let data = self.data();
        if data.name.is_empty() {
            return Err(malformed_error!("Variable without a name"));
        }
        if data.declared_type.is_empty() {
            return Err(malformed_error!(
                "Variable '{}' without a declared type",
                data.name
            ));
        }
        if !matches!(self, Variable::Parameter(_)) && data.owner.is_empty() {
            return Err(malformed_error!(
                "Member variable '{}' without a declaring type",
                data.name
            ));
        }
        Ok(())
    }

    /// The target an instance member is copied against; `None` for static members.
    ///
    /// The target must be an instance of the declaring type.
    fn instance<'a>(&self, target: Option<&'a ObjectRef>) -> Result<Option<&'a ObjectRef>> {
        let data = self.data();
        if data.is_static {
            return Ok(None);
        }
        let object = target.ok_or_else(|| {
            Error::InvalidOperation(format!(
                "Instance member '{}::{}' needs a target object",
                data.owner, data.name
            ))
        })?;
        let actual = object.type_name();
        if actual != data.owner {
            return Err(Error::InvalidOperation(format!(
                "Member '{}::{}' cannot be copied against an instance of {}",
                data.owner, data.name, actual
            )));
        }
        Ok(Some(object))
    }

    fn owner_type(&self, domain: &Domain) -> Result<TypeHandle> {
        domain.resolve_type(&TypeRef::local(self.data().owner.clone()))
    }

    /// Checks that the declaring type declares this field with the same staticness.
    fn declared_field(&self, domain: &Domain) -> Result<()> {
        let data = self.data();
        let owner = self.owner_type(domain)?;
        match owner.type_def().field(&data.name) {
            Some(field) if field.is_static() == data.is_static => Ok(()),
            _ => Err(Error::MemberNotFound {
                member: data.name.clone(),
                type_name: data.owner.clone(),
                module: owner.module().name().to_string(),
            }),
        }
    }

    fn accessor(&self, domain: &Domain, setter: bool) -> Result<(TypeHandle, String)> {
        let data = self.data();
        let owner = self.owner_type(domain)?;
        let property = owner
            .type_def()
            .property(&data.name)
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: ReferenceKind::Property,
                name: data.name.clone(),
                owner: data.owner.clone(),
                method: "<variable copy>".to_string(),
            })?;
        if property.is_static() != data.is_static {
            return Err(Error::MemberNotFound {
                member: data.name.clone(),
                type_name: data.owner.clone(),
                module: owner.module().name().to_string(),
            });
        }
        let accessor = if setter {
            property.setter.clone()
        } else {
            property.getter.clone()
        };
        let accessor = accessor.ok_or_else(|| Error::AccessorUnavailable {
            property: data.name.clone(),
            type_name: data.owner.clone(),
        })?;
        Ok((owner, accessor))
    }

    /// Reads the current value from `target` (or from the type, for static members).
    ///
    /// # Errors
    ///
    /// - [`Error::Malformed`] for a variable that fails [`Variable::validate`]
    /// - [`Error::InvalidOperation`] for parameters, instance members without a target,
    ///   or a target that is not an instance of the declaring type
    /// - [`Error::AccessorUnavailable`] for properties without a getter
    /// - [`Error::ReferenceNotFound`] / [`Error::MemberNotFound`] for members the declaring
    ///   type does not declare with the variable's staticness
    pub fn copy_from(&mut self, domain: &Domain, target: Option<&ObjectRef>) -> Result<()> {
        self.validate()?;
        if let Variable::Field(_) = self {
            self.declared_field(domain)?;
        }
        let value = match &*self {
            Variable::Parameter(data) => {
                return Err(Error::InvalidOperation(format!(
                    "Parameter '{}' cannot be copied from an object",
                    data.name
                )))
            }
            Variable::Field(data) => match self.instance(target)? {
                Some(object) => object.field(&data.name).ok_or_else(|| Error::MemberNotFound {
                    member: data.name.clone(),
                    type_name: data.owner.clone(),
                    module: domain
                        .module_of(&data.owner)
                        .map(|module| module.name().to_string())
                        .unwrap_or_default(),
                })?,
                None => domain.get_static(&data.owner, &data.name)?,
            },
            Variable::Property(_) => {
                let (owner, getter) = self.accessor(domain, false)?;
                let receiver = self.instance(target)?;
                let method =
                    MethodRef::new(TypeRef::local(owner.type_def().full_name()), getter, &[]);
                domain.invoke(&method, receiver, Vec::new())?
            }
        };
        self.data_mut().value = value;
        Ok(())
    }

    /// Writes the value onto `target` (or onto the type, for static members).
    ///
    /// Writing is idempotent: applying the same variable twice leaves the same state as
    /// applying it once.
    ///
    /// # Errors
    ///
    /// - [`Error::Malformed`] for a variable that fails [`Variable::validate`]
    /// - [`Error::InvalidOperation`] for parameters, instance members without a target,
    ///   a target that is not an instance of the declaring type, or a value that does
    ///   not match the declared type
    /// - [`Error::AccessorUnavailable`] for properties without a setter
    /// - [`Error::ReferenceNotFound`] / [`Error::MemberNotFound`] for members the declaring
    ///   type does not declare with the variable's staticness
    pub fn copy_to(&self, domain: &Domain, target: Option<&ObjectRef>) -> Result<()> {
        let data = self.data();
        self.validate()?;
        if let Variable::Parameter(_) = self {
            return Err(Error::InvalidOperation(format!(
                "Parameter '{}' cannot be copied onto an object",
                data.name
            )));
        }
        if let Variable::Field(_) = self {
            self.declared_field(domain)?;
        }
        if !data.value.matches_type(&data.declared_type) {
            return Err(Error::InvalidOperation(format!(
                "Value of type {} cannot be assigned to '{}::{}' of type {}",
                data.value.type_name(),
                data.owner,
                data.name,
                data.declared_type
            )));
        }

        match self {
            Variable::Field(_) => match self.instance(target)? {
                Some(object) => object.set_field(data.name.clone(), data.value.clone()),
                None => domain.set_static(&data.owner, &data.name, data.value.clone())?,
            },
            Variable::Property(_) => {
                let (owner, setter) = self.accessor(domain, true)?;
                let receiver = self.instance(target)?;
                let method = MethodRef::new(
                    TypeRef::local(owner.type_def().full_name()),
                    setter,
                    &[data.declared_type.as_str()],
                );
                domain.invoke(&method, receiver, vec![data.value.clone()])?;
            }
            Variable::Parameter(_) => {}
        }
        Ok(())
    }
}

/// Snapshots the non-local state of `type_name` named by `members`.
///
/// Instance members are read from `receiver` and skipped when there is none (static
/// methods). Properties without a getter are skipped with a warning.
///
/// # Errors
///
/// Returns [`Error::MemberNotFound`] / [`Error::ReferenceNotFound`] if a recorded
/// member no longer exists, or any error raised by a getter.
pub fn capture_non_locals(
    domain: &Domain,
    type_name: &str,
    members: &ReachableMembers,
    receiver: Option<&ObjectRef>,
) -> Result<Vec<Variable>> {
    let owner = domain.resolve_type(&TypeRef::local(type_name))?;
    let type_def = owner.type_def();
    let mut variables = Vec::new();

    for id in members.fields.iter().filter(|id| id.type_name == type_name) {
        let field = type_def.field(&id.name).ok_or_else(|| Error::ReferenceNotFound {
            kind: ReferenceKind::Field,
            name: id.name.clone(),
            owner: type_name.to_string(),
            method: "<capture>".to_string(),
        })?;
        if !field.is_static() && receiver.is_none() {
            continue;
        }
        let mut variable = Variable::field(
            type_name,
            &field.name,
            &field.type_name,
            Value::Null,
            field.is_static(),
        );
        variable.copy_from(domain, receiver)?;
        variables.push(variable);
    }

    for id in members.properties.iter().filter(|id| id.type_name == type_name) {
        let property = type_def
            .property(&id.name)
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: ReferenceKind::Property,
                name: id.name.clone(),
                owner: type_name.to_string(),
                method: "<capture>".to_string(),
            })?;
        if !property.is_static() && receiver.is_none() {
            continue;
        }
        let mut variable = Variable::property(
            type_name,
            &property.name,
            &property.type_name,
            Value::Null,
            property.is_static(),
        );
        match variable.copy_from(domain, receiver) {
            Ok(()) => variables.push(variable),
            Err(Error::AccessorUnavailable { property, type_name }) => {
                log::warn!("Skipping property {type_name}::{property} without a getter");
            }
            Err(error) => return Err(error),
        }
    }

    Ok(variables)
}

/// Writes every variable onto `target`, skipping properties without a setter.
///
/// # Errors
///
/// Returns the first error other than [`Error::AccessorUnavailable`].
pub fn apply_non_locals(
    domain: &Domain,
    variables: &[Variable],
    target: Option<&ObjectRef>,
) -> Result<()> {
    for variable in variables {
        match variable.copy_to(domain, target) {
            Ok(()) => {}
            Err(Error::AccessorUnavailable { property, type_name }) => {
                log::warn!("Skipping write-back of {type_name}::{property}: no setter");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// Re-reads every variable from `target`, skipping properties without a getter.
///
/// # Errors
///
/// Returns the first error other than [`Error::AccessorUnavailable`].
pub fn refresh_non_locals(
    domain: &Domain,
    variables: &mut [Variable],
    target: Option<&ObjectRef>,
) -> Result<()> {
    for variable in variables.iter_mut() {
        match variable.copy_from(domain, target) {
            Ok(()) => {}
            Err(Error::AccessorUnavailable { property, type_name }) => {
                log::warn!("Skipping read-back of {type_name}::{property}: no getter");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::INT32,
        test::factories::{cart_module, counter_module},
    };

    fn domain() -> Domain {
        let domain = Domain::new();
        domain.load(counter_module()).unwrap();
        domain
    }

    #[test]
    fn test_parameters_never_copy() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let mut parameter = Variable::parameter("amount", INT32, Value::I32(1));
        assert!(matches!(
            parameter.copy_from(&domain, Some(&object)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            parameter.copy_to(&domain, Some(&object)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_field_round_trip_and_idempotence() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let variables = vec![
            Variable::field("Shop.Counter", "count", INT32, Value::I32(9), false),
            Variable::field("Shop.Counter", "instances", INT32, Value::I32(4), true),
        ];

        apply_non_locals(&domain, &variables, Some(&object)).unwrap();
        let once = object.snapshot();
        apply_non_locals(&domain, &variables, Some(&object)).unwrap();
        assert_eq!(object.snapshot(), once);
        assert_eq!(object.field("count"), Some(Value::I32(9)));
        assert_eq!(
            domain.get_static("Shop.Counter", "instances").unwrap(),
            Value::I32(4)
        );
    }

    #[test]
    fn test_property_without_setter_is_skipped() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let label = Variable::property(
            "Shop.Counter",
            "Label",
            crate::ir::STRING,
            Value::Str("x".into()),
            false,
        );
        assert!(matches!(
            label.copy_to(&domain, Some(&object)),
            Err(Error::AccessorUnavailable { .. })
        ));
        apply_non_locals(&domain, &[label], Some(&object)).unwrap();
    }

    #[test]
    fn test_property_goes_through_accessors() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        Variable::property("Shop.Counter", "Count", INT32, Value::I32(42), false)
            .copy_to(&domain, Some(&object))
            .unwrap();
        assert_eq!(object.field("count"), Some(Value::I32(42)));

        let mut count = Variable::property("Shop.Counter", "Count", INT32, Value::Null, false);
        count.copy_from(&domain, Some(&object)).unwrap();
        assert_eq!(count.value(), &Value::I32(42));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let wrong = Variable::field("Shop.Counter", "count", INT32, Value::Str("9".into()), false);
        assert!(wrong.copy_to(&domain, Some(&object)).is_err());
    }

    #[test]
    fn test_undeclared_field_is_not_written() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let before = object.snapshot();

        let undeclared =
            Variable::field("Shop.Counter", "no_such_field", INT32, Value::I32(1), false);
        assert!(matches!(
            undeclared.copy_to(&domain, Some(&object)),
            Err(Error::MemberNotFound { ref member, .. }) if member == "no_such_field"
        ));
        assert!(matches!(
            apply_non_locals(&domain, &[undeclared], Some(&object)),
            Err(Error::MemberNotFound { .. })
        ));
        assert_eq!(object.snapshot(), before);
        assert_eq!(object.field("no_such_field"), None);
    }

    #[test]
    fn test_staticness_must_match_declaration() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let before = object.snapshot();

        let instances = Variable::field("Shop.Counter", "instances", INT32, Value::I32(3), false);
        assert!(matches!(
            instances.copy_to(&domain, Some(&object)),
            Err(Error::MemberNotFound { .. })
        ));
        assert_eq!(object.snapshot(), before);

        let mut count = Variable::field("Shop.Counter", "count", INT32, Value::Null, true);
        assert!(matches!(
            count.copy_from(&domain, Some(&object)),
            Err(Error::MemberNotFound { .. })
        ));
    }

    #[test]
    fn test_unnamed_variable_is_not_written() {
        let domain = domain();
        let object = domain.construct("Shop.Counter").unwrap();
        let before = object.snapshot();

        let unnamed = Variable::field("Shop.Counter", "", INT32, Value::I32(1), false);
        assert!(matches!(
            apply_non_locals(&domain, &[unnamed], Some(&object)),
            Err(Error::Malformed { .. })
        ));
        assert_eq!(object.snapshot(), before);
    }

    #[test]
    fn test_foreign_owner_is_rejected() {
        let domain = domain();
        domain.load(cart_module()).unwrap();
        let counter = domain.construct("Shop.Counter").unwrap();
        let before = counter.snapshot();

        // `Shop.Cart` declares `count` too, but the target is a counter.
        let foreign = Variable::field("Shop.Cart", "count", INT32, Value::I32(99), false);
        assert!(matches!(
            foreign.copy_to(&domain, Some(&counter)),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(counter.snapshot(), before);

        let mut read = Variable::field("Shop.Cart", "count", INT32, Value::Null, false);
        assert!(matches!(
            read.copy_from(&domain, Some(&counter)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(Variable::parameter("", INT32, Value::Null).validate().is_err());
        assert!(Variable::field("", "count", INT32, Value::Null, false)
            .validate()
            .is_err());
        assert!(Variable::field("Shop.Counter", "count", INT32, Value::Null, false)
            .validate()
            .is_ok());
    }
}
