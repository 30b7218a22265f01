use crate::expr::{Env, Expr};
use crate::hub::{pair, Hub, Sender};
use crate::value::Value;
use monad::{Cont, Error, Result};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Lazy expression builder over a sender.
///
/// Each operation grows the expression without executing anything;
/// `eval` ships the expression through the sender and resolves with
/// the peer's evaluation result.
#[derive(Clone)]
pub struct Proxy {
    sender: Sender,
    expr: Expr,
}

impl Proxy {
    pub fn new(sender: Sender, expr: Expr) -> Proxy {
        Proxy { sender, expr }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Call the current expression; arguments become constants.
    pub fn call(self, args: Vec<Value>) -> Proxy {
        self.call_kw(args, BTreeMap::new())
    }

    pub fn call_kw(self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Proxy {
        Proxy {
            expr: Expr::Call {
                func: Box::new(self.expr),
                args: args.into_iter().map(|arg| Expr::Const(arg)).collect(),
                kwargs: kwargs
                    .into_iter()
                    .map(|(key, value)| (key, Expr::Const(value)))
                    .collect(),
            },
            sender: self.sender,
        }
    }

    pub fn attr(self, name: impl Into<String>) -> Proxy {
        Proxy {
            expr: Expr::get_attr(self.expr, name),
            sender: self.sender,
        }
    }

    pub fn index(self, item: Value) -> Proxy {
        Proxy {
            expr: Expr::get_item(self.expr, Expr::Const(item)),
            sender: self.sender,
        }
    }

    /// The force operation: await the expression's monadic result on
    /// the peer side.
    pub fn bind(self) -> Proxy {
        Proxy {
            expr: Expr::bind(self.expr),
            sender: self.sender,
        }
    }

    /// Execute remotely: send the expression, resolve with the result
    /// of its evaluation at the peer.
    pub fn eval(&self) -> Cont<Value> {
        self.sender.call(Value::Expr(Box::new(self.expr.clone())))
    }

    /// Send the disposal sentinel, tearing down the peer handler.
    pub fn dispose(&self) {
        let _ = self.sender.try_send(Value::Null);
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Proxy(addr:{}, expr:{:?})", self.sender.addr(), self.expr)
    }
}

fn reply(src: Option<Sender>, result: Result<Value>) {
    match src {
        Some(src) => {
            let value = match result {
                Ok(value) => value,
                Err(error) => Value::Error(error),
            };
            if let Err(error) = src.send(value, None) {
                tracing::warn!(%error, "proxy reply could not be delivered");
            }
        }
        None => {
            if let Err(error) = result {
                tracing::error!(%error, trace = error.trace(), "unaddressed proxy failure");
            }
        }
    }
}

/// Install an expression-evaluating handler around `target`, returning
/// a proxy pointing at it. The disposal sentinel (null) removes the
/// handler and, with `dispose_target`, disposes native targets too.
pub fn proxify(target: Value, dispose_target: bool, hub: &Hub) -> Result<Proxy> {
    let (receiver, sender) = pair(hub);
    let env = Rc::new(Env::with_arg("target", target.clone()));
    receiver.recv(move |msg, _dst, src| match msg {
        Value::Null => {
            if dispose_target {
                if let Value::Native(native) = &target {
                    native.0.dispose();
                }
            }
            Ok(false)
        }
        Value::Expr(expr) => {
            expr.eval(&env).run(move |result| reply(src, result));
            Ok(true)
        }
        other => Err(Error::value(format!(
            "proxy handler expects an expression, got {}",
            other.type_name()
        ))),
    })?;
    Ok(Proxy::new(sender, Expr::Arg("target".into())))
}

/// Callable handle around an asynchronous function registered on the
/// hub. The function itself never crosses the wire; the sender does.
pub struct FuncProxy {
    sender: Option<Sender>,
}

impl FuncProxy {
    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    pub fn call(&self, args: Vec<Value>) -> Cont<Value> {
        match &self.sender {
            Some(sender) => sender.call(Value::List(args)),
            None => Cont::error(Error::value("function proxy has been disposed")),
        }
    }

    pub fn dispose(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.try_send(Value::Null);
        }
    }
}

/// Expose an asynchronous function as a callable proxy.
pub fn proxify_func(
    func: impl Fn(Vec<Value>) -> Cont<Value> + 'static,
    hub: &Hub,
) -> Result<FuncProxy> {
    let (receiver, sender) = pair(hub);
    receiver.recv(move |msg, _dst, src| match msg {
        Value::Null => Ok(false),
        Value::List(args) => {
            func(args).run(move |result| reply(src, result));
            Ok(true)
        }
        other => Err(Error::value(format!(
            "function proxy expects an argument list, got {}",
            other.type_name()
        ))),
    })?;
    Ok(FuncProxy {
        sender: Some(sender),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::Closure;
    use std::cell::RefCell;

    fn sample(cont: Cont<Value>) -> Rc<RefCell<Option<Result<Value>>>> {
        let out = Rc::new(RefCell::new(None));
        let slot = out.clone();
        cont.run(move |result| *slot.borrow_mut() = Some(result));
        out
    }

    fn nested_map() -> Value {
        let mut inner = BTreeMap::new();
        inner.insert("b".to_string(), Value::Int(42));
        let mut outer = BTreeMap::new();
        outer.insert("a".to_string(), Value::Map(inner));
        Value::Map(outer)
    }

    #[test]
    fn test_item_chain_through_proxify() {
        let hub = Hub::new();
        let proxy = proxify(nested_map(), false, &hub).unwrap();
        let out = sample(
            proxy
                .clone()
                .index(Value::Str("a".into()))
                .index(Value::Str("b".into()))
                .eval(),
        );
        assert_eq!(*out.borrow(), Some(Ok(Value::Int(42))));
    }

    #[test]
    fn test_proxy_call_and_bind() {
        let hub = Hub::new();
        let proxy = proxify(
            Value::Closure(Closure::new("builtins", "defer")),
            false,
            &hub,
        )
        .unwrap();
        // target(7) produces a monadic value; bind forces it remotely.
        let out = sample(proxy.clone().call(vec![Value::Int(7)]).bind().eval());
        assert_eq!(*out.borrow(), Some(Ok(Value::Int(7))));
    }

    #[test]
    fn test_errors_travel_back_as_results() {
        let hub = Hub::new();
        let proxy = proxify(nested_map(), false, &hub).unwrap();
        let out = sample(proxy.clone().index(Value::Str("missing".into())).eval());
        let borrowed = out.borrow();
        let error = borrowed.as_ref().unwrap().as_ref().unwrap_err();
        assert_eq!(error.kind(), monad::ErrorKind::Key);
    }

    #[test]
    fn test_dispose_sentinel_removes_handler() {
        let hub = Hub::new();
        let proxy = proxify(Value::Int(1), false, &hub).unwrap();
        assert_eq!(hub.len(), 1);
        proxy.dispose();
        assert_eq!(hub.len(), 0);
        let out = sample(proxy.eval());
        assert!(matches!(*out.borrow(), Some(Err(_))));
    }

    #[test]
    fn test_proxify_func_round_trip() {
        let hub = Hub::new();
        let mut doubler = proxify_func(
            |args| {
                Cont::from_result(
                    args.first()
                        .ok_or_else(|| Error::value("missing argument"))
                        .and_then(|value| value.as_int())
                        .map(|n| Value::Int(n * 2)),
                )
            },
            &hub,
        )
        .unwrap();

        let out = sample(doubler.call(vec![Value::Int(21)]));
        assert_eq!(*out.borrow(), Some(Ok(Value::Int(42))));

        doubler.dispose();
        let out = sample(doubler.call(vec![Value::Int(1)]));
        assert!(matches!(*out.borrow(), Some(Err(_))));
    }
}
