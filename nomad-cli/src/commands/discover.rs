use std::path::{Path, PathBuf};

use anyhow::Context;
use nomad::analysis::{ModuleSet, ReferenceDiscoverer};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{load_module, load_modules},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct ClosureEntry {
    declaring_type: String,
    method: String,
    mode: String,
    fields: Vec<String>,
    properties: Vec<String>,
    methods: Vec<String>,
    modules: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DiscoverOutput {
    module: String,
    closures: Vec<ClosureEntry>,
}

pub fn run(
    path: &Path,
    dependencies: &[PathBuf],
    type_filter: Option<&str>,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let dependencies = load_modules(dependencies)?;
    let discoverer =
        ReferenceDiscoverer::new(ModuleSet::new(&module).with_dependencies(&dependencies));

    let mut closures = Vec::new();
    for type_def in &module.types {
        let full_name = type_def.full_name();
        if let Some(filter) = type_filter {
            if !full_name.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }

        for method in type_def.methods.iter().filter(|m| module.is_nomadic(type_def, m)) {
            let reachable = discoverer
                .discover(&full_name, method)
                .with_context(|| format!("discovery failed for {full_name}::{}", method.name))?;
            closures.push(ClosureEntry {
                declaring_type: full_name.clone(),
                method: method.name.clone(),
                mode: method.nomad.unwrap_or_default().mode.to_string(),
                fields: reachable.fields.iter().map(|f| f.name.clone()).collect(),
                properties: reachable.properties.iter().map(|p| p.name.clone()).collect(),
                methods: reachable.methods.iter().map(ToString::to_string).collect(),
                modules: reachable.modules.iter().cloned().collect(),
            });
        }
    }

    let output = DiscoverOutput {
        module: module.name.clone(),
        closures,
    };
    print_output(&output, opts, |out| {
        if out.closures.is_empty() {
            println!("{}: no nomadic methods", out.module);
            return;
        }
        for closure in &out.closures {
            println!(
                "\n{}::{} ({})",
                closure.declaring_type, closure.method, closure.mode
            );
            let mut tw = TabWriter::new(&[("Kind", Align::Left), ("Members", Align::Left)])
                .indent("  ");
            for (kind, members) in [
                ("fields", &closure.fields),
                ("properties", &closure.properties),
                ("methods", &closure.methods),
                ("modules", &closure.modules),
            ] {
                let listed = if members.is_empty() {
                    "-".to_string()
                } else {
                    members.join(", ")
                };
                tw.row(vec![kind.to_string(), listed]);
            }
            tw.print();
        }
    })
}
