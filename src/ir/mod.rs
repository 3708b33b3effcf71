//! Intermediate representation of code modules.
//!
//! Nomadic methods are rewritten at build time. Instead of patching a native bytecode
//! format, code modules are expressed in a small explicit IR that the rewriter transforms
//! and the [`crate::runtime`] interprets:
//!
//! - [`Value`] / [`ObjectRef`] - run-time values and shared instances
//! - [`Instruction`] - stack-machine instructions with symbolic member references
//! - [`CodeModule`], [`TypeDef`], [`MethodDef`], [`FieldDef`], [`PropertyDef`] - definitions
//! - [`MethodBuilder`] / [`InstructionAssembler`] - fluent construction of method bodies
//!
//! # Examples
//!
//! ```rust
//! use nomad::ir::{CodeModule, FieldDef, MethodBuilder, TypeDef, TypeRef, Value, INT32};
//!
//! let counter = TypeRef::local("Shop.Counter");
//! let get = MethodBuilder::new("Get")
//!     .returns(INT32)
//!     .implementation(move |asm| {
//!         asm.ldthis().ldfld(&counter, "count").ret();
//!     })
//!     .build()?;
//!
//! let module = CodeModule::new("Shop.nmod").with_type(
//!     TypeDef::new("Shop", "Counter")
//!         .with_field(FieldDef::new("count", INT32).with_initial(Value::I32(3)))
//!         .with_method(get)
//!         .with_default_constructor(),
//! );
//! assert!(module.type_def("Shop.Counter").is_some());
//! # Ok::<(), nomad::Error>(())
//! ```

mod builder;
mod instruction;
mod module;
mod value;

pub use builder::{InstructionAssembler, MethodBuilder};
pub use instruction::{
    BinaryOp, CompareOp, DispatchSite, FieldRef, Instruction, MethodKey, MethodRef, TypeRef,
};
pub use module::{
    CodeModule, ExecutionMode, FieldDef, MemberFlags, MethodDef, MethodFlags, ModuleFlags,
    NomadAttribute, ParamDef, PropertyDef, TypeDef, TypeFlags, CONSTRUCTOR_NAME,
};
pub use value::{
    is_primitive, Object, ObjectRef, Value, BOOL, FLOAT64, INT32, INT64, LIST, OBJECT, STRING,
};
