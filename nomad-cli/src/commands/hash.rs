use std::path::PathBuf;

use anyhow::Context;
use nomad::utils::DigestAlgorithm;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::file_display_name,
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct HashEntry {
    file: String,
    size: usize,
    digest: String,
}

#[derive(Debug, Serialize)]
struct HashOutput {
    algorithm: String,
    files: Vec<HashEntry>,
}

pub fn run(paths: &[PathBuf], algorithm: &str, opts: &GlobalOptions) -> anyhow::Result<()> {
    let algorithm: DigestAlgorithm = algorithm
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown digest algorithm '{algorithm}' (sha1, md5)"))?;

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        files.push(HashEntry {
            file: file_display_name(path),
            size: data.len(),
            digest: algorithm.digest(&data),
        });
    }

    let output = HashOutput {
        algorithm: algorithm.to_string(),
        files,
    };
    print_output(&output, opts, |out| {
        let mut tw = TabWriter::new(&[
            ("File", Align::Left),
            ("Size", Align::Right),
            ("Digest", Align::Left),
        ]);
        for f in &out.files {
            tw.row(vec![f.file.clone(), f.size.to_string(), f.digest.clone()]);
        }
        tw.print();
    })
}
