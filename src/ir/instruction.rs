//! Instruction set of the code-module intermediate representation.
//!
//! Method bodies are flat lists of [`Instruction`]s executed by a stack machine
//! (see [`crate::runtime`]). Branch operands are instruction indices inside the same
//! body, which keeps rewriting simple: inserting a prefix of `n` instructions means
//! shifting every branch target by `n`.
//!
//! Members are referenced symbolically through [`TypeRef`], [`FieldRef`] and
//! [`MethodRef`], resolved against the loaded modules when the body runs and against
//! the module set during discovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ir::{ExecutionMode, Value};

/// A reference to a type, optionally scoped to another code module.
///
/// A `scope` of `None` means the module containing the reference. `Some(name)` names a
/// dependency module, which is how cross-module references end up in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    /// Module defining the type, `None` for the referencing module
    pub scope: Option<String>,
    /// Namespace-qualified type name, e.g. `Shop.Order`
    pub full_name: String,
}

impl TypeRef {
    /// Reference to a type in the referencing module.
    #[must_use]
    pub fn local(full_name: impl Into<String>) -> Self {
        TypeRef {
            scope: None,
            full_name: full_name.into(),
        }
    }

    /// Reference to a type defined in the module `scope`.
    #[must_use]
    pub fn external(scope: impl Into<String>, full_name: impl Into<String>) -> Self {
        TypeRef {
            scope: Some(scope.into()),
            full_name: full_name.into(),
        }
    }

    /// The namespace part of the full name (empty for the global namespace).
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map_or("", |(namespace, _)| namespace)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "[{scope}]{}", self.full_name),
            None => f.write_str(&self.full_name),
        }
    }
}

/// A reference to a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldRef {
    /// Declaring type
    pub owner: TypeRef,
    /// Field name
    pub name: String,
}

impl FieldRef {
    /// Creates a field reference.
    #[must_use]
    pub fn new(owner: TypeRef, name: impl Into<String>) -> Self {
        FieldRef {
            owner,
            name: name.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.name)
    }
}

/// A reference to a method, including its parameter types to pick an overload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRef {
    /// Declaring type
    pub owner: TypeRef,
    /// Method name
    pub name: String,
    /// Declared parameter types, excluding the receiver
    pub param_types: Vec<String>,
}

impl MethodRef {
    /// Creates a method reference.
    #[must_use]
    pub fn new(owner: TypeRef, name: impl Into<String>, param_types: &[&str]) -> Self {
        MethodRef {
            owner,
            name: name.into(),
            param_types: param_types.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// The scope-independent identity of the referenced method.
    #[must_use]
    pub fn key(&self) -> MethodKey {
        MethodKey {
            type_name: self.owner.full_name.clone(),
            name: self.name.clone(),
            param_types: self.param_types.clone(),
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.owner,
            self.name,
            self.param_types.join(", ")
        )
    }
}

/// Identity of a method independent of where it was referenced from.
///
/// Used as the memoization key for discovery and as the key of the server's dispatch
/// table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub name: String,
    /// Declared parameter types
    pub param_types: Vec<String>,
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.type_name,
            self.name,
            self.param_types.join(", ")
        )
    }
}

/// Binary arithmetic and logic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    /// Addition, or concatenation for strings and lists
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (integer division for integers)
    Div,
    /// Remainder
    Rem,
    /// Logical / bitwise and
    And,
    /// Logical / bitwise or
    Or,
}

/// Comparison operations, each pushing a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CompareOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

/// The call site installed by the rewriter to hand a method over to an execution client.
///
/// Executing the site pushes the remote return value followed by a boolean telling
/// whether the call was executed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchSite {
    /// Type of the execution client that performs the dispatch
    pub client: TypeRef,
    /// Execution mode declared on the nomadic method
    pub mode: ExecutionMode,
    /// Whether the server should run the method on its main thread
    pub run_on_main_thread: bool,
    /// The nomadic method as seen by callers (not the moved relay body)
    pub method: MethodRef,
    /// Number of leading arguments forwarded as parameters
    pub param_count: u16,
}

/// One instruction of a method body.
///
/// # Stack effects
///
/// | Instruction | Pops | Pushes |
/// |---|---|---|
/// | `Const`, `LdArg`, `LdLoc`, `LdThis`, `LdSFld` | 0 | 1 |
/// | `StArg`, `StLoc`, `StSFld`, `Pop`, `BrTrue`, `BrFalse` | 1 | 0 |
/// | `LdFld` | object | value |
/// | `StFld` | object, value | 0 |
/// | `Call` | receiver (instance methods), arguments | return value (non-void) |
/// | `NewObj` | 0 | new instance |
/// | `Binary`, `Compare` | 2 | 1 |
/// | `Not` | 1 | 1 |
/// | `Dup` | 1 | 2 |
/// | `Ret` | return value (non-void) | - |
/// | `Throw` | message | - |
/// | `Dispatch` | 0 | return value, executed flag |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Does nothing
    Nop,
    /// Push a constant
    Const(Value),
    /// Push an argument
    LdArg(u16),
    /// Store into an argument
    StArg(u16),
    /// Push a local
    LdLoc(u16),
    /// Store into a local
    StLoc(u16),
    /// Push the receiver of an instance method
    LdThis,
    /// Load an instance field
    LdFld(FieldRef),
    /// Store an instance field
    StFld(FieldRef),
    /// Load a static field
    LdSFld(FieldRef),
    /// Store a static field
    StSFld(FieldRef),
    /// Call a method
    Call(MethodRef),
    /// Create an instance through the type's parameterless constructor
    NewObj(TypeRef),
    /// Binary operation
    Binary(BinaryOp),
    /// Comparison
    Compare(CompareOp),
    /// Logical negation
    Not,
    /// Unconditional branch
    Br(usize),
    /// Branch if the popped value is true
    BrTrue(usize),
    /// Branch if the popped value is false
    BrFalse(usize),
    /// Duplicate the top of the stack
    Dup,
    /// Discard the top of the stack
    Pop,
    /// Return from the method
    Ret,
    /// Raise a user exception carrying the popped message
    Throw,
    /// Hand the current invocation to an execution client
    Dispatch(DispatchSite),
}

impl Instruction {
    /// Returns the mnemonic used by the disassembly output.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Const(_) => "const",
            Instruction::LdArg(_) => "ldarg",
            Instruction::StArg(_) => "starg",
            Instruction::LdLoc(_) => "ldloc",
            Instruction::StLoc(_) => "stloc",
            Instruction::LdThis => "ldthis",
            Instruction::LdFld(_) => "ldfld",
            Instruction::StFld(_) => "stfld",
            Instruction::LdSFld(_) => "ldsfld",
            Instruction::StSFld(_) => "stsfld",
            Instruction::Call(_) => "call",
            Instruction::NewObj(_) => "newobj",
            Instruction::Binary(_) => "binary",
            Instruction::Compare(_) => "cmp",
            Instruction::Not => "not",
            Instruction::Br(_) => "br",
            Instruction::BrTrue(_) => "brtrue",
            Instruction::BrFalse(_) => "brfalse",
            Instruction::Dup => "dup",
            Instruction::Pop => "pop",
            Instruction::Ret => "ret",
            Instruction::Throw => "throw",
            Instruction::Dispatch(_) => "dispatch",
        }
    }

    /// Returns the branch target of branch instructions.
    #[must_use]
    pub fn branch_target(&self) -> Option<usize> {
        match self {
            Instruction::Br(target) | Instruction::BrTrue(target) | Instruction::BrFalse(target) => {
                Some(*target)
            }
            _ => None,
        }
    }

    /// Returns a mutable reference to the branch target of branch instructions.
    pub fn branch_target_mut(&mut self) -> Option<&mut usize> {
        match self {
            Instruction::Br(target) | Instruction::BrTrue(target) | Instruction::BrFalse(target) => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Ret | Instruction::Throw | Instruction::Br(_)
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.mnemonic();
        match self {
            Instruction::Const(value) => write!(f, "{mnemonic} {value}"),
            Instruction::LdArg(index)
            | Instruction::StArg(index)
            | Instruction::LdLoc(index)
            | Instruction::StLoc(index) => write!(f, "{mnemonic} {index}"),
            Instruction::LdFld(field)
            | Instruction::StFld(field)
            | Instruction::LdSFld(field)
            | Instruction::StSFld(field) => write!(f, "{mnemonic} {field}"),
            Instruction::Call(method) => write!(f, "{mnemonic} {method}"),
            Instruction::NewObj(type_ref) => write!(f, "{mnemonic} {type_ref}"),
            Instruction::Binary(op) => write!(f, "{op}"),
            Instruction::Compare(op) => write!(f, "{mnemonic}.{op}"),
            Instruction::Br(target) | Instruction::BrTrue(target) | Instruction::BrFalse(target) => {
                write!(f, "{mnemonic} IL_{target:04}")
            }
            Instruction::Dispatch(site) => write!(
                f,
                "{mnemonic} {} via {} ({} args{})",
                site.mode,
                site.client,
                site.param_count,
                if site.run_on_main_thread { ", main thread" } else { "" }
            ),
            _ => f.write_str(mnemonic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ref_namespace() {
        assert_eq!(TypeRef::local("Shop.Orders.Order").namespace(), "Shop.Orders");
        assert_eq!(TypeRef::local("Order").namespace(), "");
        assert_eq!(
            TypeRef::external("Billing.nmod", "Billing.Invoice").to_string(),
            "[Billing.nmod]Billing.Invoice"
        );
    }

    #[test]
    fn test_branch_targets() {
        let mut br = Instruction::BrFalse(4);
        assert_eq!(br.branch_target(), Some(4));
        *br.branch_target_mut().unwrap() += 3;
        assert_eq!(br, Instruction::BrFalse(7));
        assert_eq!(Instruction::Ret.branch_target(), None);
        assert!(Instruction::Br(0).is_terminator());
        assert!(!Instruction::BrTrue(0).is_terminator());
    }

    #[test]
    fn test_display() {
        let call = Instruction::Call(MethodRef::new(
            TypeRef::local("Shop.Order"),
            "Add",
            &["System.Int32"],
        ));
        assert_eq!(call.to_string(), "call Shop.Order::Add(System.Int32)");
        assert_eq!(Instruction::Binary(BinaryOp::Add).to_string(), "add");
        assert_eq!(Instruction::Compare(CompareOp::Lt).to_string(), "cmp.lt");
        assert_eq!(Instruction::Br(12).to_string(), "br IL_0012");
    }
}
