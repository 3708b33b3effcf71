use std::path::{Path, PathBuf};

use anyhow::Context;
use nomad::{config::NomadConfig, ir::CodeModule};

/// Loads a code module, reading JSON when the file extension is `.json` and the
/// binary module format otherwise.
pub fn load_module(path: &Path) -> anyhow::Result<CodeModule> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    if is_json_file(path) {
        let module: CodeModule = serde_json::from_slice(&data)
            .with_context(|| format!("invalid module JSON: {}", path.display()))?;
        module
            .validate()
            .with_context(|| format!("invalid module: {}", path.display()))?;
        Ok(module)
    } else {
        CodeModule::from_bytes(&data)
            .with_context(|| format!("failed to load module: {}", path.display()))
    }
}

pub fn load_modules(paths: &[PathBuf]) -> anyhow::Result<Vec<CodeModule>> {
    paths.iter().map(|path| load_module(path)).collect()
}

/// Reads a [`NomadConfig`] from a JSON file; missing keys take their defaults.
pub fn load_config(path: &Path) -> anyhow::Result<NomadConfig> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("invalid config: {}", path.display()))
}

pub fn is_json_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Extract a display-friendly filename from a path.
pub fn file_display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    )
}
