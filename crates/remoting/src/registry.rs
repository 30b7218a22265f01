use crate::expr::{Env, Expr};
use crate::value::Value;
use crate::wire::WireExpr;
use common::Event;
use monad::{Cont, Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

/// Reference to a function declared in the registry: functions that
/// cross the wire are named ahead of time, never shipped as code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Closure {
    pub module: String,
    pub name: String,
}

impl Closure {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Closure {
        Closure {
            module: module.into(),
            name: name.into(),
        }
    }
}

pub type NativeFn = Rc<dyn Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value>>;

/// Expression lambda: the shippable unit of behavior. Positional
/// parameters bind by name into the evaluation environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: WireExpr,
}

/// A module's shippable definition set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub defs: Vec<(String, Lambda)>,
}

/// Source record for one module, the shape shipped by the bootstrap
/// packer and the remote importer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub source: Vec<u8>,
    pub filename: String,
    pub is_package: bool,
    pub package: Option<String>,
}

impl ModuleRecord {
    pub fn from_def(name: impl Into<String>, def: &ModuleDef) -> Result<ModuleRecord> {
        let name = name.into();
        let source = postcard::to_stdvec(def)
            .map_err(|err| Error::value(format!("module encoding failed: {err}")))?;
        Ok(ModuleRecord {
            filename: format!("<{name}>"),
            name,
            source,
            is_package: false,
            package: None,
        })
    }

    pub fn def(&self) -> Result<ModuleDef> {
        postcard::from_bytes(&self.source)
            .map_err(|err| Error::value(format!("module {} decoding failed: {err}", self.name)))
    }

    /// Map form, for travelling inside expressions and messages.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::Str(self.name.clone()));
        map.insert(
            "source".to_string(),
            Value::Bytes(bytes::Bytes::from(self.source.clone())),
        );
        map.insert("filename".to_string(), Value::Str(self.filename.clone()));
        map.insert("is_package".to_string(), Value::Bool(self.is_package));
        map.insert(
            "package".to_string(),
            match &self.package {
                Some(package) => Value::Str(package.clone()),
                None => Value::Null,
            },
        );
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<ModuleRecord> {
        let Value::Map(map) = value else {
            return Err(Error::value(format!(
                "module record must be a map, got {}",
                value.type_name()
            )));
        };
        let field = |name: &str| {
            map.get(name)
                .ok_or_else(|| Error::key(format!("module record is missing {name:?}")))
        };
        let source = match field("source")? {
            Value::Bytes(source) => source.to_vec(),
            other => {
                return Err(Error::value(format!(
                    "module source must be bytes, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(ModuleRecord {
            name: field("name")?.as_str()?.to_string(),
            source,
            filename: field("filename")?.as_str()?.to_string(),
            is_package: matches!(field("is_package")?, Value::Bool(true)),
            package: match field("package")? {
                Value::Null => None,
                other => Some(other.as_str()?.to_string()),
            },
        })
    }
}

struct RegistryInner {
    natives: RefCell<HashMap<Closure, NativeFn>>,
    modules: RefCell<HashSet<String>>,
    records: RefCell<HashMap<String, ModuleRecord>>,
    loading: RefCell<HashSet<String>>,
    loaded: Event<String>,
    main: RefCell<Option<String>>,
}

/// Per-thread registry of named functions and shippable modules.
///
/// Closures resolve here at call time. A module being fetched over a
/// connection sits in the `loading` set; deserialization touching it
/// aborts with an interrupt error and retries once `loaded` fires.
pub struct Registry {
    inner: Rc<RegistryInner>,
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Registry {
            inner: self.inner.clone(),
        }
    }
}

thread_local! {
    static LOCAL: RefCell<Option<Registry>> = const { RefCell::new(None) };
}

impl Registry {
    pub fn new() -> Registry {
        let registry = Registry {
            inner: Rc::new(RegistryInner {
                natives: RefCell::new(HashMap::new()),
                modules: RefCell::new(HashSet::new()),
                records: RefCell::new(HashMap::new()),
                loading: RefCell::new(HashSet::new()),
                loaded: Event::new(),
                main: RefCell::new(None),
            }),
        };
        crate::builtins::install(&registry);
        registry
    }

    pub fn local() -> Registry {
        LOCAL.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(registry) => registry.clone(),
                None => {
                    let registry = Registry::new();
                    *slot = Some(registry.clone());
                    registry
                }
            }
        })
    }

    pub fn set_local(registry: &Registry) {
        LOCAL.with(|slot| *slot.borrow_mut() = Some(registry.clone()));
    }

    /// Declare a native function under (module, name).
    pub fn register(
        &self,
        module: &str,
        name: &str,
        function: impl Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value> + 'static,
    ) {
        self.inner
            .natives
            .borrow_mut()
            .insert(Closure::new(module, name), Rc::new(function));
        self.inner.modules.borrow_mut().insert(module.to_string());
    }

    /// Register a shippable module record, installing its expression
    /// lambdas as callable functions.
    pub fn add_module(&self, record: ModuleRecord) -> Result<()> {
        let def = record.def()?;
        for (name, lambda) in &def.defs {
            let closure = Closure::new(&record.name, name);
            let function = lambda_fn(lambda.clone())?;
            self.inner.natives.borrow_mut().insert(closure, function);
        }
        self.inner.modules.borrow_mut().insert(record.name.clone());
        let name = record.name.clone();
        self.inner.records.borrow_mut().insert(name.clone(), record);
        self.inner.loaded.fire(&name);
        Ok(())
    }

    /// Declare which registered module is the application's top-level
    /// one; the importer ships it eagerly.
    pub fn set_main(&self, module: &str) {
        *self.inner.main.borrow_mut() = Some(module.to_string());
    }

    pub fn main_module(&self) -> Option<String> {
        self.inner.main.borrow().clone()
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.inner.modules.borrow().contains(module)
    }

    pub fn is_loading(&self, module: &str) -> bool {
        self.inner.loading.borrow().contains(module)
    }

    pub fn mark_loading(&self, module: &str) -> bool {
        self.inner.loading.borrow_mut().insert(module.to_string())
    }

    /// Clear the loading mark and wake interrupted deserializations,
    /// whether or not the fetch produced a module.
    pub fn finish_loading(&self, module: &str) {
        self.inner.loading.borrow_mut().remove(module);
        self.inner.loaded.fire(&module.to_string());
    }

    /// Resolves when any module finishes loading.
    pub fn loaded(&self) -> Cont<String> {
        self.inner.loaded.next()
    }

    pub fn resolve(&self, closure: &Closure) -> Result<NativeFn> {
        self.inner
            .natives
            .borrow()
            .get(closure)
            .cloned()
            .ok_or_else(|| {
                Error::key(format!(
                    "unresolved closure {}:{}",
                    closure.module, closure.name
                ))
            })
    }

    /// The shippable record for `module`, if one exists. Modules with
    /// only native functions have no source to ship.
    pub fn record(&self, module: &str) -> Option<ModuleRecord> {
        self.inner.records.borrow().get(module).cloned()
    }

    pub fn records(&self) -> Vec<ModuleRecord> {
        self.inner.records.borrow().values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn lambda_fn(lambda: Lambda) -> Result<NativeFn> {
    let body = Rc::new(Expr::from_wire_plain(&lambda.body)?);
    let params = Rc::new(lambda.params);
    Ok(Rc::new(move |args, kwargs| {
        if args.len() > params.len() {
            return Err(Error::value(format!(
                "lambda takes {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        let mut bound: BTreeMap<String, Value> = BTreeMap::new();
        for (param, arg) in params.iter().zip(args) {
            bound.insert(param.clone(), arg);
        }
        for (key, value) in kwargs {
            if !params.contains(&key) {
                return Err(Error::key(format!("unexpected keyword argument {key:?}")));
            }
            bound.insert(key, value);
        }
        for param in params.iter() {
            if !bound.contains_key(param) {
                return Err(Error::key(format!("missing argument {param:?}")));
            }
        }
        let env = Rc::new(Env::new(bound));
        Ok(Value::from_cont(body.eval(&env)))
    }))
}
