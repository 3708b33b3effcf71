//! Build-time transformation of nomadic methods.
//!
//! - [`MethodRewriter`] installs the dispatch shape of one method's execution mode
//! - [`ModuleProcessor`] discovers and rewrites every nomadic method of a module and
//!   produces the client module, the paired server module and the dependency bundle
//!
//! # Examples
//!
//! ```rust,no_run
//! use nomad::ir::CodeModule;
//! use nomad::rewrite::ModuleProcessor;
//!
//! let module = CodeModule::from_bytes(&std::fs::read("Shop.nmod")?)?;
//! let processor = ModuleProcessor::new().with_listener(|event| {
//!     println!("{}: nomadic={}", event.module_name, event.has_nomadic_elements);
//! });
//! if let Some(processed) = processor.process(&module, &[])? {
//!     processed.write_to("out/client".as_ref(), "out/server".as_ref())?;
//! }
//! # Ok::<(), nomad::Error>(())
//! ```

mod processor;
mod rewriter;

pub use processor::{
    bundled_module, ModuleProcessor, ProcessedModule, ProcessingEvent, BUNDLE_RESOURCE_PREFIX,
};
pub use rewriter::{relay_body_name, MethodRewriter, RewrittenMethod, RELAY_MARKER_PARAM};
