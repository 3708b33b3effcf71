//! Method builder for creating IR method definitions.
//!
//! This module provides [`MethodBuilder`], which assembles a [`MethodDef`] from a
//! signature and an implementation closure, and [`InstructionAssembler`], the fluent
//! instruction emitter handed to that closure. Branches are written against named
//! labels and resolved to instruction indices when the body is finished.

use std::collections::HashMap;

use crate::{
    ir::{
        BinaryOp, CompareOp, ExecutionMode, FieldRef, Instruction, MethodDef, MethodFlags,
        MethodRef, NomadAttribute, ParamDef, TypeRef, Value,
    },
    Result,
};

/// Type alias for method body implementation closures
type ImplementationFn = Box<dyn FnOnce(&mut InstructionAssembler)>;

/// A branch whose label has not been resolved yet.
enum Pending {
    Ready(Instruction),
    Br(String),
    BrTrue(String),
    BrFalse(String),
}

/// Fluent emitter for method bodies.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{InstructionAssembler, BinaryOp, CompareOp, Value};
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldarg(0)
///     .constant(Value::I32(0))
///     .compare(CompareOp::Gt)
///     .brfalse("negative")
///     .ldarg(0)
///     .ret()
///     .label("negative")
///     .constant(Value::I32(0))
///     .ret();
/// let body = asm.finish()?;
/// assert_eq!(body.len(), 8);
/// # Ok::<(), nomad::Error>(())
/// ```
#[derive(Default)]
pub struct InstructionAssembler {
    instructions: Vec<Pending>,
    labels: HashMap<String, usize>,
}

impl InstructionAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an arbitrary instruction.
    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(Pending::Ready(instruction));
        self
    }

    /// Defines `name` at the position of the next emitted instruction.
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.instructions.len());
        self
    }

    /// `nop`
    pub fn nop(&mut self) -> &mut Self {
        self.emit(Instruction::Nop)
    }

    /// Pushes a constant.
    pub fn constant(&mut self, value: Value) -> &mut Self {
        self.emit(Instruction::Const(value))
    }

    /// Pushes a string constant.
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.emit(Instruction::Const(Value::Str(value.to_string())))
    }

    /// Pushes an argument.
    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.emit(Instruction::LdArg(index))
    }

    /// Stores an argument.
    pub fn starg(&mut self, index: u16) -> &mut Self {
        self.emit(Instruction::StArg(index))
    }

    /// Pushes a local.
    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.emit(Instruction::LdLoc(index))
    }

    /// Stores a local.
    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.emit(Instruction::StLoc(index))
    }

    /// Pushes the receiver.
    pub fn ldthis(&mut self) -> &mut Self {
        self.emit(Instruction::LdThis)
    }

    /// Loads an instance field.
    pub fn ldfld(&mut self, owner: &TypeRef, name: &str) -> &mut Self {
        self.emit(Instruction::LdFld(FieldRef::new(owner.clone(), name)))
    }

    /// Stores an instance field.
    pub fn stfld(&mut self, owner: &TypeRef, name: &str) -> &mut Self {
        self.emit(Instruction::StFld(FieldRef::new(owner.clone(), name)))
    }

    /// Loads a static field.
    pub fn ldsfld(&mut self, owner: &TypeRef, name: &str) -> &mut Self {
        self.emit(Instruction::LdSFld(FieldRef::new(owner.clone(), name)))
    }

    /// Stores a static field.
    pub fn stsfld(&mut self, owner: &TypeRef, name: &str) -> &mut Self {
        self.emit(Instruction::StSFld(FieldRef::new(owner.clone(), name)))
    }

    /// Calls a method.
    pub fn call(&mut self, owner: &TypeRef, name: &str, param_types: &[&str]) -> &mut Self {
        self.emit(Instruction::Call(MethodRef::new(
            owner.clone(),
            name,
            param_types,
        )))
    }

    /// Creates an instance.
    pub fn newobj(&mut self, type_ref: &TypeRef) -> &mut Self {
        self.emit(Instruction::NewObj(type_ref.clone()))
    }

    /// Binary operation.
    pub fn binary(&mut self, op: BinaryOp) -> &mut Self {
        self.emit(Instruction::Binary(op))
    }

    /// `add`
    pub fn add(&mut self) -> &mut Self {
        self.binary(BinaryOp::Add)
    }

    /// Comparison.
    pub fn compare(&mut self, op: CompareOp) -> &mut Self {
        self.emit(Instruction::Compare(op))
    }

    /// `not`
    pub fn not(&mut self) -> &mut Self {
        self.emit(Instruction::Not)
    }

    /// Unconditional branch to a label.
    pub fn br(&mut self, label: &str) -> &mut Self {
        self.instructions.push(Pending::Br(label.to_string()));
        self
    }

    /// Branch to a label if true.
    pub fn brtrue(&mut self, label: &str) -> &mut Self {
        self.instructions.push(Pending::BrTrue(label.to_string()));
        self
    }

    /// Branch to a label if false.
    pub fn brfalse(&mut self, label: &str) -> &mut Self {
        self.instructions.push(Pending::BrFalse(label.to_string()));
        self
    }

    /// `dup`
    pub fn dup(&mut self) -> &mut Self {
        self.emit(Instruction::Dup)
    }

    /// `pop`
    pub fn pop(&mut self) -> &mut Self {
        self.emit(Instruction::Pop)
    }

    /// `ret`
    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instruction::Ret)
    }

    /// `throw`
    pub fn throw(&mut self) -> &mut Self {
        self.emit(Instruction::Throw)
    }

    /// Number of instructions emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if nothing was emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Resolves labels and returns the finished body.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if a branch names an undefined label or any
    /// label points past the last instruction, whether or not a branch targets it.
    pub fn finish(self) -> Result<Vec<Instruction>> {
        let len = self.instructions.len();
        let resolve = |label: &str| -> Result<usize> {
            match self.labels.get(label) {
                Some(&target) if target < len => Ok(target),
                Some(_) => Err(malformed_error!("Label '{}' points past the body", label)),
                None => Err(malformed_error!("Undefined label '{}'", label)),
            }
        };

        if let Some((label, _)) = self.labels.iter().find(|(_, &target)| target >= len) {
            return Err(malformed_error!("Label '{}' points past the body", label));
        }

        self.instructions
            .iter()
            .map(|pending| match pending {
                Pending::Ready(instruction) => Ok(instruction.clone()),
                Pending::Br(label) => Ok(Instruction::Br(resolve(label)?)),
                Pending::BrTrue(label) => Ok(Instruction::BrTrue(resolve(label)?)),
                Pending::BrFalse(label) => Ok(Instruction::BrFalse(resolve(label)?)),
            })
            .collect()
    }
}

/// Builder for creating method definitions.
///
/// # Examples
///
/// ```rust
/// use nomad::ir::{MethodBuilder, ExecutionMode, TypeRef, INT32};
///
/// let counter = TypeRef::local("Shop.Counter");
/// let increment = MethodBuilder::new("Increment")
///     .nomadic(ExecutionMode::Normal)
///     .implementation(move |asm| {
///         asm.ldthis()
///             .ldthis()
///             .ldfld(&counter, "count")
///             .constant(nomad::ir::Value::I32(1))
///             .add()
///             .stfld(&counter, "count")
///             .ret();
///     })
///     .build()?;
/// assert!(increment.nomad.is_some());
/// # Ok::<(), nomad::Error>(())
/// ```
pub struct MethodBuilder {
    name: String,
    flags: MethodFlags,
    params: Vec<ParamDef>,
    return_type: Option<String>,
    locals: u16,
    nomad: Option<NomadAttribute>,
    implementation: Option<ImplementationFn>,
}

impl MethodBuilder {
    /// Create a new builder for an instance method returning nothing.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: MethodFlags::empty(),
            params: Vec::new(),
            return_type: None,
            locals: 0,
            nomad: None,
            implementation: None,
        }
    }

    /// Makes the method static.
    #[must_use]
    pub fn static_method(mut self) -> Self {
        self.flags |= MethodFlags::STATIC;
        self
    }

    /// Adds flags.
    #[must_use]
    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Appends a required parameter.
    #[must_use]
    pub fn param(mut self, name: &str, type_name: &str) -> Self {
        self.params.push(ParamDef::new(name, type_name));
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, type_name: &str) -> Self {
        self.return_type = Some(type_name.to_string());
        self
    }

    /// Reserves local slots.
    #[must_use]
    pub fn locals(mut self, count: u16) -> Self {
        self.locals = count;
        self
    }

    /// Marks the method nomadic under `mode`.
    #[must_use]
    pub fn nomadic(mut self, mode: ExecutionMode) -> Self {
        self.nomad = Some(NomadAttribute::new(mode));
        self
    }

    /// Marks the method nomadic with a full attribute.
    #[must_use]
    pub fn nomad_attribute(mut self, attribute: NomadAttribute) -> Self {
        self.nomad = Some(attribute);
        self
    }

    /// Sets the body emitter.
    #[must_use]
    pub fn implementation<F>(mut self, implementation: F) -> Self
    where
        F: FnOnce(&mut InstructionAssembler) + 'static,
    {
        self.implementation = Some(Box::new(implementation));
        self
    }

    /// Assembles the method.
    ///
    /// A method without an implementation gets a body consisting of a single `ret`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the body references undefined labels.
    pub fn build(self) -> Result<MethodDef> {
        let body = match self.implementation {
            Some(implementation) => {
                let mut asm = InstructionAssembler::new();
                implementation(&mut asm);
                asm.finish()?
            }
            None => vec![Instruction::Ret],
        };

        Ok(MethodDef {
            name: self.name,
            flags: self.flags,
            params: self.params,
            return_type: self.return_type,
            locals: self.locals,
            body,
            nomad: self.nomad,
            relay_body: None,
            reachable: None,
        })
    }
}
