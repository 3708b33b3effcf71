use std::path::{Path, PathBuf};

use anyhow::Context;
use nomad::rewrite::ModuleProcessor;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{load_config, load_module, load_modules},
    output::{print_output, Align, TabWriter},
};

pub struct OutputDirs<'a> {
    pub client: &'a Path,
    pub server: &'a Path,
}

#[derive(Debug, Serialize)]
struct RewrittenEntry {
    declaring_type: String,
    method: String,
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay_body: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessOutput {
    module: String,
    has_nomadic_elements: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    methods: Vec<RewrittenEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bundle: Vec<String>,
}

pub fn run(
    path: &Path,
    dependencies: &[PathBuf],
    dirs: &OutputDirs<'_>,
    config: Option<&Path>,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let dependencies = load_modules(dependencies)?;
    let config = match config {
        Some(config) => load_config(config)?,
        None => Default::default(),
    };

    let processor = ModuleProcessor::new().with_digest(config.client.digest);
    let processed = processor
        .process(&module, &dependencies)
        .with_context(|| format!("failed to process {}", module.name))?;

    let output = match processed {
        None => ProcessOutput {
            module: module.name.clone(),
            has_nomadic_elements: false,
            client_path: None,
            server_path: None,
            methods: Vec::new(),
            bundle: Vec::new(),
        },
        Some(processed) => {
            let (client_path, server_path) = processed
                .write_to(dirs.client, dirs.server)
                .context("failed to write processed modules")?;
            ProcessOutput {
                module: module.name.clone(),
                has_nomadic_elements: true,
                client_path: Some(client_path),
                server_path: Some(server_path),
                methods: processed
                    .methods
                    .iter()
                    .map(|m| RewrittenEntry {
                        declaring_type: m.type_name.clone(),
                        method: m.method.clone(),
                        mode: m.mode.to_string(),
                        relay_body: m.relay_body.clone(),
                    })
                    .collect(),
                bundle: processed.bundle.iter().cloned().collect(),
            }
        }
    };

    print_output(&output, opts, |out| {
        if !out.has_nomadic_elements {
            println!("{}: no nomadic methods, nothing written", out.module);
            return;
        }

        println!("Module:  {}", out.module);
        if let (Some(client), Some(server)) = (&out.client_path, &out.server_path) {
            println!("Client:  {}", client.display());
            println!("Server:  {}", server.display());
        }
        if !out.bundle.is_empty() {
            println!("Bundle:  {}", out.bundle.join(", "));
        }
        println!();

        let mut tw = TabWriter::new(&[
            ("Type", Align::Left),
            ("Method", Align::Left),
            ("Mode", Align::Left),
            ("Relay body", Align::Left),
        ]);
        for m in &out.methods {
            tw.row(vec![
                m.declaring_type.clone(),
                m.method.clone(),
                m.mode.clone(),
                m.relay_body.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }
        tw.print();
    })
}
