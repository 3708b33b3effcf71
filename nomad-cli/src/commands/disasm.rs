use std::path::Path;

use nomad::ir::{MethodDef, TypeDef};

use crate::commands::common::load_module;

pub fn run(
    path: &Path,
    type_filter: Option<&str>,
    method_filter: Option<&str>,
) -> anyhow::Result<()> {
    let module = load_module(path)?;

    println!("// module {}", module.name);
    if !module.references.is_empty() {
        println!("// references {}", module.references.join(", "));
    }
    if let Some(paired) = &module.paired_hash {
        println!("// paired with client {paired}");
    }

    for type_def in &module.types {
        let full_name = type_def.full_name();
        if let Some(filter) = type_filter {
            if !full_name.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }

        let methods: Vec<&MethodDef> = type_def
            .methods
            .iter()
            .filter(|m| method_filter.is_none_or(|name| m.name == name))
            .collect();
        if methods.is_empty() && method_filter.is_some() {
            continue;
        }

        println!();
        print_type_header(type_def);
        for method in methods {
            print_method(method);
        }
        println!("}}");
    }
    Ok(())
}

fn print_type_header(type_def: &TypeDef) {
    let flags: Vec<&str> = type_def.flags.iter_names().map(|(name, _)| name).collect();
    if flags.is_empty() {
        println!(".class {} {{", type_def.full_name());
    } else {
        println!(".class [{}] {} {{", flags.join(" "), type_def.full_name());
    }
    for field in &type_def.fields {
        let storage = if field.is_static() { "static " } else { "" };
        println!("  .field {storage}{} {}", field.type_name, field.name);
    }
    for property in &type_def.properties {
        println!(
            "  .property {} {} (get: {}, set: {})",
            property.type_name,
            property.name,
            property.getter.as_deref().unwrap_or("-"),
            property.setter.as_deref().unwrap_or("-"),
        );
    }
}

fn print_method(method: &MethodDef) {
    let params: Vec<String> = method
        .params
        .iter()
        .map(|p| format!("{} {}", p.type_name, p.name))
        .collect();
    let flags: Vec<&str> = method.flags.iter_names().map(|(name, _)| name).collect();

    println!();
    println!(
        "  .method [{}] {} {}({})",
        flags.join(" "),
        method.return_type.as_deref().unwrap_or("void"),
        method.name,
        params.join(", ")
    );
    if let Some(attribute) = method.nomad {
        let thread = if attribute.run_on_main_thread {
            ", main thread"
        } else {
            ""
        };
        println!("  // nomadic {}{thread}", attribute.mode);
    }
    if let Some(relay_body) = &method.relay_body {
        println!("  // body relayed to {relay_body}");
    }
    println!("  {{");
    if method.locals > 0 {
        println!("    .locals {}", method.locals);
    }
    for (index, instruction) in method.body.iter().enumerate() {
        println!("    IL_{index:04}: {instruction}");
    }
    println!("  }}");
}
