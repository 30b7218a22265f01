use crate::conn::Connection;
use crate::expr::Expr;
use crate::hub::{pair, Hub, Sender};
use crate::proxy::Proxy;
use crate::registry::{ModuleRecord, Registry};
use crate::value::Value;
use monad::{cont, Cont, Error, Result};

/// Serving side of the remote import mechanism.
///
/// The importer lives on the client: it answers module-name requests
/// with shippable source records. Installing it on a connection gives
/// the peer's deserializer a fallback for unknown modules.
pub struct Importer {
    sender: Option<Sender>,
}

impl Importer {
    /// Install the serving handler on `hub`: a module-name request is
    /// answered with the registry's record for it, or null when the
    /// module has nothing shippable.
    pub fn create(hub: &Hub, registry: &Registry) -> Result<Importer> {
        let registry = registry.clone();
        let (receiver, sender) = pair(hub);
        receiver.recv(move |msg, _dst, src| match msg {
            Value::Null => Ok(false),
            Value::Str(name) => {
                let reply = match registry.record(&name) {
                    Some(record) => record.to_value(),
                    None => Value::Null,
                };
                if let Some(src) = src {
                    src.send(reply, None)?;
                }
                Ok(true)
            }
            other => Err(Error::value(format!(
                "importer expects a module name, got {}",
                other.type_name()
            ))),
        })?;
        Ok(Importer {
            sender: Some(sender),
        })
    }

    /// Create the serving handler and hook it into the peer's import
    /// chain; then eagerly ship the application's main module, if one
    /// is declared, and install its name mapping on the peer.
    pub fn install(conn: &Connection) -> Cont<Importer> {
        let conn = conn.clone();
        cont(async move {
            let registry = conn.registry();
            let importer = Importer::create(&conn.hub(), &registry)?;
            let service = importer
                .sender
                .clone()
                .expect("freshly created importer has a sender");

            let peer = || Proxy::new(conn.sender(), Expr::Arg("conn".into()));
            peer()
                .attr("install_importer")
                .call(vec![Value::Sender(service)])
                .eval()
                .await?;

            if let Some(main) = registry.main_module() {
                if let Some(record) = registry.record(&main) {
                    peer()
                        .attr("add_module")
                        .call(vec![record.to_value()])
                        .eval()
                        .await?;
                    peer()
                        .attr("map_module")
                        .call(vec![
                            Value::Str("__main__".into()),
                            Value::Str(main.clone()),
                        ])
                        .eval()
                        .await?;
                }
            }
            Ok(importer)
        })
    }

    pub fn dispose(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.try_send(Value::Null);
        }
    }
}

/// Peer-side synchronous fetch, driven from deserialization.
///
/// Import resolution must return before the deserializer resumes, so
/// this starts the request and iterates the reactor inline until the
/// reply future completes. The loading mark makes concurrent frames
/// that touch the same module abort with an interrupt and retry.
pub(crate) fn fetch(conn: &Connection, module: &str) -> Result<()> {
    let Some(service) = conn.importer_sender() else {
        return Ok(());
    };
    if conn.import_missed(module) {
        return Ok(());
    }

    let registry = conn.registry();
    registry.mark_loading(module);
    let reply = service.call(Value::Str(module.to_string())).promise();
    let fetched = conn.core().run_until(&reply);
    let outcome = match fetched {
        Ok(Value::Null) => {
            conn.note_import_miss(module);
            Ok(())
        }
        Ok(value) => ModuleRecord::from_value(&value)
            .and_then(|record| registry.add_module(record))
            .map_err(|error| error.context(format!("while importing module {module:?}"))),
        Err(error) => Err(error.hop(format!("remote import of {module:?}"))),
    };
    registry.finish_loading(module);
    outcome
}
