//! Built-in closures present in every registry, so both ends of a
//! connection can rely on them without shipping anything.

use crate::registry::Registry;
use crate::value::Value;
use monad::{Cont, Error, Result};

pub const MODULE: &str = "builtins";

fn one(mut args: Vec<Value>) -> Result<Value> {
    if args.len() != 1 {
        return Err(Error::value(format!(
            "expected one argument, got {}",
            args.len()
        )));
    }
    Ok(args.pop().expect("one argument"))
}

pub(crate) fn install(registry: &Registry) {
    registry.register(MODULE, "identity", |args, _kwargs| one(args));

    registry.register(MODULE, "defer", |args, _kwargs| {
        let value = one(args)?;
        Ok(Value::from_cont(Cont::unit(value)))
    });

    registry.register(MODULE, "add", |args, _kwargs| {
        let mut total = 0i64;
        for arg in &args {
            total += arg.as_int()?;
        }
        Ok(Value::Int(total))
    });

    registry.register(MODULE, "concat", |args, _kwargs| {
        let mut out = String::new();
        for arg in &args {
            out.push_str(arg.as_str()?);
        }
        Ok(Value::Str(out))
    });

    registry.register(MODULE, "len", |args, _kwargs| {
        let value = one(args)?;
        let len = match &value {
            Value::Str(value) => value.len(),
            Value::Bytes(value) => value.len(),
            Value::List(value) => value.len(),
            Value::Map(value) => value.len(),
            other => {
                return Err(Error::value(format!(
                    "{} has no length",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Int(len as i64))
    });
}
