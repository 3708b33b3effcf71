//! Runtime-library methods implemented by the host.
//!
//! Types in the excluded `System` namespace are never defined by code modules. Calls to
//! them are served by these natives, registered on every new [`Domain`].

use crate::{
    ir::{Value, INT32, LIST, OBJECT, STRING},
    runtime::{Domain, NativeMethod},
    Error, Result,
};

/// Name of the thread that runs main-thread requests on a server.
pub const MAIN_THREAD_NAME: &str = "nomad-main";

/// Renders a value the way string concatenation sees it.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arity(type_name: &str, method: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "{type_name}::{method} takes {expected} arguments, got {}",
            args.len()
        )))
    }
}

fn list_arg<'a>(method: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(Error::InvalidOperation(format!(
            "{LIST}::{method} expects a list, got {}",
            other.type_name()
        ))),
    }
}

/// Registers the built-in natives on `domain`.
pub(crate) fn register_defaults(domain: &Domain) {
    domain.register_native(
        STRING,
        "Concat",
        NativeMethod::new(|_, args| {
            arity(STRING, "Concat", args, 2)?;
            Ok(Value::Str(format!("{}{}", text_of(&args[0]), text_of(&args[1]))))
        }),
    );
    domain.register_native(
        STRING,
        "Length",
        NativeMethod::new(|_, args| {
            arity(STRING, "Length", args, 1)?;
            let length = args[0].as_str().map_or(0, |s| s.chars().count());
            Ok(Value::I32(i32::try_from(length).unwrap_or(i32::MAX)))
        }),
    );
    domain.register_native(
        OBJECT,
        "ToString",
        NativeMethod::new(|_, args| {
            arity(OBJECT, "ToString", args, 1)?;
            Ok(Value::Str(text_of(&args[0])))
        }),
    );
    domain.register_native(
        LIST,
        "New",
        NativeMethod::new(|_, args| {
            arity(LIST, "New", args, 0)?;
            Ok(Value::List(Vec::new()))
        }),
    );
    domain.register_native(
        LIST,
        "Append",
        NativeMethod::new(|_, args| {
            arity(LIST, "Append", args, 2)?;
            let mut items = match &args[0] {
                Value::Null => Vec::new(),
                other => list_arg("Append", other)?.clone(),
            };
            items.push(args[1].clone());
            Ok(Value::List(items))
        }),
    );
    domain.register_native(
        LIST,
        "Count",
        NativeMethod::new(|_, args| {
            arity(LIST, "Count", args, 1)?;
            let count = match &args[0] {
                Value::Null => 0,
                other => list_arg("Count", other)?.len(),
            };
            Ok(Value::I32(i32::try_from(count).unwrap_or(i32::MAX)))
        }),
    );
    domain.register_native(
        LIST,
        "Get",
        NativeMethod::new(|_, args| {
            arity(LIST, "Get", args, 2)?;
            let items = list_arg("Get", &args[0])?;
            args[1]
                .as_i64()
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "Index {} out of range for a list of {} ({INT32} expected)",
                        args[1],
                        items.len()
                    ))
                })
        }),
    );
    domain.register_native(
        "System.Environment",
        "get_MachineName",
        NativeMethod::new(|domain, args| {
            arity("System.Environment", "get_MachineName", args, 0)?;
            Ok(Value::Str(domain.host_name().to_string()))
        }),
    );
    domain.register_native(
        "System.Threading.Thread",
        "get_Name",
        NativeMethod::new(|_, args| {
            arity("System.Threading.Thread", "get_Name", args, 0)?;
            Ok(std::thread::current()
                .name()
                .map_or(Value::Null, |name| Value::Str(name.to_string())))
        }),
    );
}
