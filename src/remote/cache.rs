//! Server-side record of which module version serves which type.

use std::{collections::HashMap, path::PathBuf, sync::Arc, sync::Mutex};

use crate::{
    remote::Request,
    runtime::{Domain, LoadedModule},
    Error, Result,
};

#[derive(Default)]
struct CacheState {
    /// Module file name to the request hash it was loaded for
    modules: HashMap<String, String>,
    /// Type full name to (module file name, request hash)
    types: HashMap<String, (String, String)>,
}

/// Maps requested types to loaded modules, detecting stale versions.
///
/// Every lookup runs check-then-load-then-insert under one lock, so concurrent first
/// requests for a type load its module once.
#[derive(Default)]
pub(crate) struct ModuleCache {
    state: Mutex<CacheState>,
}

impl ModuleCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the module serving `request`, loading it from the path `locate` finds.
    ///
    /// `Ok(None)` means the module is unknown to this host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleModule`] if the type or module was cached under another
    /// hash, and any error from `locate` or from loading the file.
    pub(crate) fn resolve<F>(
        &self,
        domain: &Domain,
        request: &Request,
        locate: F,
    ) -> Result<Option<Arc<LoadedModule>>>
    where
        F: FnOnce() -> Result<Option<PathBuf>>,
    {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;

        let cached_hash = state
            .types
            .get(&request.type_full_name)
            .map(|(_, hash)| hash)
            .or_else(|| state.modules.get(&request.module_file_name));
        if let Some(hash) = cached_hash {
            if hash != &request.module_hash {
                let error = Error::StaleModule {
                    module: request.module_file_name.clone(),
                    type_name: request.type_full_name.clone(),
                    loaded_hash: hash.clone(),
                    requested_hash: request.module_hash.clone(),
                };
                log::error!("{error}");
                return Err(error);
            }
            if let Some(loaded) = domain.module(&request.module_file_name) {
                Self::record(&mut state, &loaded, request);
                return Ok(Some(loaded));
            }
        }

        let Some(path) = locate()? else {
            return Ok(None);
        };
        let loaded = domain.load_file(&path)?;
        log::debug!(
            "Loaded {} ({}) from {}",
            loaded.name(),
            request.module_hash,
            path.display()
        );
        Self::record(&mut state, &loaded, request);
        Ok(Some(loaded))
    }

    fn record(state: &mut CacheState, loaded: &LoadedModule, request: &Request) {
        state
            .modules
            .insert(loaded.name().to_string(), request.module_hash.clone());
        if loaded.module().type_def(&request.type_full_name).is_some() {
            state.types.insert(
                request.type_full_name.clone(),
                (loaded.name().to_string(), request.module_hash.clone()),
            );
        }
    }

    /// Number of module versions recorded.
    pub(crate) fn len(&self) -> usize {
        lock!(self.state).modules.len()
    }
}
