use crate::hub::{Address, Sender};
use crate::registry::Closure;
use crate::Expr;
use bytes::Bytes;
use monad::{Cont, Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Hook set for local objects reachable from expressions. Every hook
/// defaults to a value error naming the object; implementors override
/// what their object supports.
pub trait NativeObject {
    fn type_name(&self) -> &'static str;

    fn get_attr(&self, name: &str) -> Result<Value> {
        Err(Error::value(format!(
            "{} has no attribute {name:?}",
            self.type_name()
        )))
    }

    fn get_item(&self, item: &Value) -> Result<Value> {
        Err(Error::value(format!(
            "{} is not indexable by {item:?}",
            self.type_name()
        )))
    }

    fn call(&self, _args: Vec<Value>, _kwargs: BTreeMap<String, Value>) -> Result<Value> {
        Err(Error::value(format!("{} is not callable", self.type_name())))
    }

    /// The embedded computation, for `Bind`.
    fn monad(&self) -> Result<Cont<Value>> {
        Err(Error::value(format!(
            "{} is not a monadic value",
            self.type_name()
        )))
    }

    fn dispose(&self) {}
}

/// Shared handle to a local native object. Never crosses the wire.
pub struct Native(pub Rc<dyn NativeObject>);

impl Clone for Native {
    fn clone(&self) -> Self {
        Native(self.0.clone())
    }
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Native({})", self.0.type_name())
    }
}

/// Message and expression value: the tagged union that (minus
/// `Native`) can cross a connection.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Addr(Address),
    Sender(Sender),
    Expr(Box<Expr>),
    Closure(Closure),
    Error(Error),
    Native(Native),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Addr(_) => "address",
            Value::Sender(_) => "sender",
            Value::Expr(_) => "expression",
            Value::Closure(_) => "closure",
            Value::Error(_) => "error",
            Value::Native(native) => native.0.type_name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::Str(value) => !value.is_empty(),
            Value::Bytes(value) => !value.is_empty(),
            Value::List(value) => !value.is_empty(),
            Value::Map(value) => !value.is_empty(),
            _ => true,
        }
    }

    pub fn native(object: impl NativeObject + 'static) -> Value {
        Value::Native(Native(Rc::new(object)))
    }

    /// Wrap an unresolved continuation as a single-use monadic value;
    /// `Bind` takes it.
    pub fn from_cont(cont: Cont<Value>) -> Value {
        Value::native(ContHandle::new(cont))
    }

    /// A callable native wrapping a plain function.
    pub fn native_fn(
        name: &'static str,
        function: impl Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value> + 'static,
    ) -> Value {
        struct FnObject {
            name: &'static str,
            function: Box<dyn Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value>>,
        }
        impl NativeObject for FnObject {
            fn type_name(&self) -> &'static str {
                self.name
            }
            fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
                (self.function)(args, kwargs)
            }
        }
        Value::native(FnObject {
            name,
            function: Box::new(function),
        })
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(value) => Ok(value),
            other => Err(Error::value(format!(
                "expected str, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(value) => Ok(*value),
            other => Err(Error::value(format!(
                "expected int, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_sender(&self) -> Result<&Sender> {
        match self {
            Value::Sender(sender) => Ok(sender),
            other => Err(Error::value(format!(
                "expected sender, found {}",
                other.type_name()
            ))),
        }
    }
}

impl Value {
    pub(crate) fn freeze(&self, codec: &dyn crate::wire::WireCodec) -> Result<crate::WireValue> {
        use crate::WireValue as W;
        Ok(match self {
            Value::Null => W::Null,
            Value::Bool(value) => W::Bool(*value),
            Value::Int(value) => W::Int(*value),
            Value::Float(value) => W::Float(*value),
            Value::Str(value) => W::Str(value.clone()),
            Value::Bytes(value) => W::Bytes(value.to_vec()),
            Value::List(items) => W::List(
                items
                    .iter()
                    .map(|item| item.freeze(codec))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => W::Map(
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), value.freeze(codec)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Addr(addr) => W::Addr(addr.segments().to_vec()),
            Value::Sender(sender) => W::Sender(codec.freeze_sender(sender)?),
            Value::Expr(expr) => W::Expr(Box::new(expr.freeze(codec)?)),
            Value::Closure(closure) => W::Closure {
                module: closure.module.clone(),
                name: closure.name.clone(),
            },
            Value::Error(error) => W::Error(error.clone()),
            Value::Native(native) => {
                return Err(Error::value(format!(
                    "{} cannot cross the wire",
                    native.0.type_name()
                )))
            }
        })
    }

    pub(crate) fn thaw(
        wire: &crate::WireValue,
        codec: &dyn crate::wire::WireCodec,
    ) -> Result<Value> {
        use crate::WireValue as W;
        Ok(match wire {
            W::Null => Value::Null,
            W::Bool(value) => Value::Bool(*value),
            W::Int(value) => Value::Int(*value),
            W::Float(value) => Value::Float(*value),
            W::Str(value) => Value::Str(value.clone()),
            W::Bytes(value) => Value::Bytes(Bytes::from(value.clone())),
            W::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| Value::thaw(item, codec))
                    .collect::<Result<_>>()?,
            ),
            W::Map(map) => Value::Map(
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), Value::thaw(value, codec)?)))
                    .collect::<Result<_>>()?,
            ),
            W::Addr(segments) => Value::Addr(Address::from_segments(segments.clone())),
            W::Sender(wire) => Value::Sender(codec.thaw_sender(wire)?),
            W::Expr(expr) => Value::Expr(Box::new(Expr::thaw(expr, codec)?)),
            W::Closure { module, name } => Value::Closure(codec.thaw_closure(module, name)?),
            W::Error(error) => Value::Error(error.clone()),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Addr(a), Addr(b)) => a.segments() == b.segments(),
            (Sender(a), Sender(b)) => a == b,
            (Expr(a), Expr(b)) => a == b,
            (Closure(a), Closure(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            (Native(a), Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Str(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Value {
        Value::Bytes(value)
    }
}

/// Single-use monadic wrapper around a continuation, produced by
/// calls whose result is awaited with `Bind`.
pub struct ContHandle {
    cont: RefCell<Option<Cont<Value>>>,
}

impl ContHandle {
    pub fn new(cont: Cont<Value>) -> ContHandle {
        ContHandle {
            cont: RefCell::new(Some(cont)),
        }
    }
}

impl NativeObject for ContHandle {
    fn type_name(&self) -> &'static str {
        "continuation"
    }

    fn monad(&self) -> Result<Cont<Value>> {
        self.cont
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::value("continuation has already been bound"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::List(vec![Value::Null]).truthy());
        assert!(!Value::Map(BTreeMap::new()).truthy());
    }

    #[test]
    fn test_cont_handle_is_single_use() {
        let handle = ContHandle::new(Cont::unit(Value::Int(1)));
        handle.monad().unwrap();
        assert!(handle.monad().is_err());
    }
}
