use crate::registry::Registry;
use crate::value::Value;
use crate::wire::{WireCodec, WireExpr};
use monad::{cont, Cont, Error, Result};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Evaluation environment: named arguments visible to `Arg` nodes.
pub struct Env {
    args: BTreeMap<String, Value>,
    registry: Registry,
}

impl Env {
    pub fn new(args: BTreeMap<String, Value>) -> Env {
        Env {
            args,
            registry: Registry::local(),
        }
    }

    pub fn with_arg(name: impl Into<String>, value: Value) -> Env {
        let mut args = BTreeMap::new();
        args.insert(name.into(), value);
        Env::new(args)
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

/// Serializable expression tree, evaluated in a peer's environment.
///
/// Sub-expressions evaluate left to right; keyword arguments evaluate
/// in alphabetized key order. A call does not await its result: a
/// monadic result stays wrapped until `Bind` splices it.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Arg(String),
    Env,
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: BTreeMap<String, Expr>,
    },
    GetAttr {
        target: Box<Expr>,
        name: String,
    },
    GetItem {
        target: Box<Expr>,
        item: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Bind(Box<Expr>),
}

impl Expr {
    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call {
            func: Box::new(func),
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn get_attr(target: Expr, name: impl Into<String>) -> Expr {
        Expr::GetAttr {
            target: Box::new(target),
            name: name.into(),
        }
    }

    pub fn get_item(target: Expr, item: Expr) -> Expr {
        Expr::GetItem {
            target: Box::new(target),
            item: Box::new(item),
        }
    }

    pub fn bind(target: Expr) -> Expr {
        Expr::Bind(Box::new(target))
    }

    pub fn eval(&self, env: &Rc<Env>) -> Cont<Value> {
        match self {
            Expr::Const(value) => Cont::unit(value.clone()),
            Expr::Arg(name) => Cont::from_result(
                env.arg(name)
                    .cloned()
                    .ok_or_else(|| Error::key(format!("no such argument: {name}"))),
            ),
            Expr::Env => Cont::unit(Value::Map(env.args.clone())),
            Expr::Call { func, args, kwargs } => {
                let func = (**func).clone();
                let args = args.clone();
                let kwargs = kwargs.clone();
                let env = env.clone();
                cont(async move {
                    let callee = func.eval(&env).await?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in &args {
                        values.push(arg.eval(&env).await?);
                    }
                    let mut keywords = BTreeMap::new();
                    for (key, arg) in &kwargs {
                        keywords.insert(key.clone(), arg.eval(&env).await?);
                    }
                    apply(&env, callee, values, keywords)
                })
            }
            Expr::GetAttr { target, name } => {
                let name = name.clone();
                target.eval(env).and_then(move |value| {
                    Cont::from_result(match &value {
                        Value::Map(map) => map
                            .get(&name)
                            .cloned()
                            .ok_or_else(|| Error::key(format!("no attribute {name:?}"))),
                        Value::Native(native) => native.0.get_attr(&name),
                        other => Err(Error::value(format!(
                            "{} has no attributes",
                            other.type_name()
                        ))),
                    })
                })
            }
            Expr::GetItem { target, item } => {
                let target = (**target).clone();
                let item = (**item).clone();
                let env = env.clone();
                cont(async move {
                    let target = target.eval(&env).await?;
                    let item = item.eval(&env).await?;
                    get_item(&target, &item)
                })
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = (**cond).clone();
                let then = (**then).clone();
                let otherwise = (**otherwise).clone();
                let env = env.clone();
                cont(async move {
                    if cond.eval(&env).await?.truthy() {
                        then.eval(&env).await
                    } else {
                        otherwise.eval(&env).await
                    }
                })
            }
            Expr::Bind(target) => {
                let target = (**target).clone();
                let env = env.clone();
                cont(async move {
                    let value = target.eval(&env).await?;
                    match value {
                        Value::Native(native) => native.0.monad()?.await,
                        other => Err(Error::value(format!(
                            "{} is not a monadic value",
                            other.type_name()
                        ))),
                    }
                })
            }
        }
    }

    /// Wire form without any transport context: senders are rejected.
    pub fn to_wire(&self) -> Result<WireExpr> {
        self.freeze(&crate::wire::PlainCodec)
    }

    /// Inverse of `to_wire`.
    pub fn from_wire_plain(wire: &WireExpr) -> Result<Expr> {
        Expr::thaw(wire, &crate::wire::PlainCodec)
    }

    pub(crate) fn freeze(&self, codec: &dyn WireCodec) -> Result<WireExpr> {
        Ok(match self {
            Expr::Const(value) => WireExpr::Const(value.freeze(codec)?),
            Expr::Arg(name) => WireExpr::Arg(name.clone()),
            Expr::Env => WireExpr::Env,
            Expr::Call { func, args, kwargs } => WireExpr::Call {
                func: Box::new(func.freeze(codec)?),
                args: args
                    .iter()
                    .map(|arg| arg.freeze(codec))
                    .collect::<Result<_>>()?,
                kwargs: kwargs
                    .iter()
                    .map(|(key, arg)| Ok((key.clone(), arg.freeze(codec)?)))
                    .collect::<Result<_>>()?,
            },
            Expr::GetAttr { target, name } => WireExpr::GetAttr {
                target: Box::new(target.freeze(codec)?),
                name: name.clone(),
            },
            Expr::GetItem { target, item } => WireExpr::GetItem {
                target: Box::new(target.freeze(codec)?),
                item: Box::new(item.freeze(codec)?),
            },
            Expr::If {
                cond,
                then,
                otherwise,
            } => WireExpr::If {
                cond: Box::new(cond.freeze(codec)?),
                then: Box::new(then.freeze(codec)?),
                otherwise: Box::new(otherwise.freeze(codec)?),
            },
            Expr::Bind(target) => WireExpr::Bind(Box::new(target.freeze(codec)?)),
        })
    }

    pub(crate) fn thaw(wire: &WireExpr, codec: &dyn WireCodec) -> Result<Expr> {
        Ok(match wire {
            WireExpr::Const(value) => Expr::Const(Value::thaw(value, codec)?),
            WireExpr::Arg(name) => Expr::Arg(name.clone()),
            WireExpr::Env => Expr::Env,
            WireExpr::Call { func, args, kwargs } => Expr::Call {
                func: Box::new(Expr::thaw(func, codec)?),
                args: args
                    .iter()
                    .map(|arg| Expr::thaw(arg, codec))
                    .collect::<Result<_>>()?,
                kwargs: kwargs
                    .iter()
                    .map(|(key, arg)| Ok((key.clone(), Expr::thaw(arg, codec)?)))
                    .collect::<Result<_>>()?,
            },
            WireExpr::GetAttr { target, name } => Expr::GetAttr {
                target: Box::new(Expr::thaw(target, codec)?),
                name: name.clone(),
            },
            WireExpr::GetItem { target, item } => Expr::GetItem {
                target: Box::new(Expr::thaw(target, codec)?),
                item: Box::new(Expr::thaw(item, codec)?),
            },
            WireExpr::If {
                cond,
                then,
                otherwise,
            } => Expr::If {
                cond: Box::new(Expr::thaw(cond, codec)?),
                then: Box::new(Expr::thaw(then, codec)?),
                otherwise: Box::new(Expr::thaw(otherwise, codec)?),
            },
            WireExpr::Bind(target) => Expr::Bind(Box::new(Expr::thaw(target, codec)?)),
        })
    }
}

fn apply(
    env: &Rc<Env>,
    callee: Value,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
) -> Result<Value> {
    match callee {
        Value::Closure(closure) => {
            let function = env.registry.resolve(&closure)?;
            (*function)(args, kwargs)
        }
        Value::Native(native) => native.0.call(args, kwargs),
        Value::Sender(sender) => {
            if args.len() != 1 || !kwargs.is_empty() {
                return Err(Error::value(
                    "a sender call takes exactly one positional argument",
                ));
            }
            let mut args = args;
            Ok(Value::from_cont(
                sender.call(args.pop().expect("one argument")),
            ))
        }
        other => Err(Error::value(format!(
            "{} is not callable",
            other.type_name()
        ))),
    }
}

fn get_item(target: &Value, item: &Value) -> Result<Value> {
    match target {
        Value::Map(map) => {
            let key = item.as_str()?;
            map.get(key)
                .cloned()
                .ok_or_else(|| Error::key(format!("no such key: {key:?}")))
        }
        Value::List(list) => {
            let index = item.as_int()?;
            let index = usize::try_from(index)
                .map_err(|_| Error::value(format!("negative index: {index}")))?;
            list.get(index)
                .cloned()
                .ok_or_else(|| Error::key(format!("index out of range: {index}")))
        }
        Value::Native(native) => native.0.get_item(item),
        other => Err(Error::value(format!(
            "{} is not indexable",
            other.type_name()
        ))),
    }
}
