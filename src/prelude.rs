//! # nomad Prelude
//!
//! The most commonly used types for building, rewriting and remotely executing code
//! modules. Import this module to get them all at once.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all nomad operations
pub use crate::Error;

/// The result type used throughout nomad
pub use crate::Result;

// ================================================================================================
// Intermediate Representation
// ================================================================================================

/// Module, type and member definitions
pub use crate::ir::{
    CodeModule, ExecutionMode, FieldDef, MethodDef, NomadAttribute, ParamDef, PropertyDef,
    TypeDef,
};

/// Method body construction
pub use crate::ir::{InstructionAssembler, MethodBuilder};

/// Run-time values and member references
pub use crate::ir::{Instruction, MethodRef, ObjectRef, TypeRef, Value};

// ================================================================================================
// Runtime
// ================================================================================================

/// Loaded-module runtime and its extension seams
pub use crate::runtime::{Dispatcher, Domain, ModuleResolver, NativeMethod};

/// Transferable state
pub use crate::variable::Variable;

// ================================================================================================
// Build Time
// ================================================================================================

/// Reference discovery
pub use crate::analysis::{ReachableMembers, ReferenceDiscoverer};

/// Rewriting
pub use crate::rewrite::{ModuleProcessor, ProcessedModule};

// ================================================================================================
// Remote Execution
// ================================================================================================

/// Client and server
pub use crate::remote::{ExecuteServiceCallResult, ExecutionClient, ExecutionServer};

/// Transports
pub use crate::remote::{Channel, ChannelFactory, InMemoryMailbox, LoopbackNetwork};

/// Fault recovery
pub use crate::remote::{Failover, FaultRecoverer, Retry};

// ================================================================================================
// Configuration
// ================================================================================================

/// Configuration values
pub use crate::config::{ClientConfig, NomadConfig, ServerConfig};
