//! Remoting kernel: in-process message hub with reversible addresses,
//! a serializable expression language, lazy proxies, framed
//! connections over child processes and byte streams, a closure
//! registry with shippable expression modules, and the on-demand
//! remote importer.

pub mod boot;
mod builtins;
pub mod conn;
pub mod peer;
mod expr;
mod hub;
mod importer;
mod proxy;
mod registry;
mod value;
mod wire;

pub use conn::{
    Connection, ForkConnection, ShellConnection, SshConnection, SshOpts, StreamConnection,
};
pub use expr::{Env, Expr};
pub use hub::{pair, Address, Hub, Receiver, Sender};
pub use importer::Importer;
pub use proxy::{proxify, proxify_func, FuncProxy, Proxy};
pub use registry::{Closure, Lambda, ModuleDef, ModuleRecord, NativeFn, Registry};
pub use value::{ContHandle, Native, NativeObject, Value};
pub use wire::{Frame, WireExpr, WireSender, WireValue, TAG_ROUTE, TAG_UNROUTE};
