use crate::conn::conn::{Connection, CONNECTED, CONNECTING};
use crate::hub::Hub;
use monad::{cont, Cont};
use reactor::Reactor;
use stream::BufferedStream;

/// Connection over a reader/writer pair of buffered streams.
pub struct StreamConnection {
    conn: Connection,
}

impl Clone for StreamConnection {
    fn clone(&self) -> Self {
        StreamConnection {
            conn: self.conn.clone(),
        }
    }
}

impl StreamConnection {
    pub fn new(hub: &Hub, core: &Reactor) -> StreamConnection {
        StreamConnection {
            conn: Connection::new(hub, core),
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Wire the transport: outgoing mailbox traffic is framed onto
    /// `writer`, and a receive coroutine length-reads frames off
    /// `reader` until cancellation or hang-up tears the connection
    /// down.
    pub fn connect(&self, reader: BufferedStream, writer: BufferedStream) -> Cont<()> {
        let this = self.clone();
        cont(async move {
            let conn = &this.conn;
            conn.transition(CONNECTING)?;

            let out = writer.clone();
            conn.start_sending(move |frame| {
                out.write_bytes(frame);
                out.flush().run_detached();
                Ok(())
            })?;

            {
                let reader = reader.clone();
                let writer = writer.clone();
                conn.add_disposal(move || {
                    use stream::Stream;
                    reader.dispose();
                    writer.dispose();
                });
            }

            spawn_receive_loop(conn.clone(), reader);
            conn.transition(CONNECTED)?;
            Ok(())
        })
    }

    pub fn dispose(&self) {
        self.conn.dispose();
    }
}

fn spawn_receive_loop(conn: Connection, reader: BufferedStream) {
    cont(async move {
        // Begin reading the next frame before dispatching the current
        // one: dispatch may dispose the connection, and the pending
        // read then resolves with the stream's cancellation.
        let mut next = reader.read_bytes().promise();
        loop {
            let frame = match next.cont().await {
                Ok(frame) => frame,
                Err(error) if error.is_canceled() || error.is_broken_pipe() => break,
                Err(error) => {
                    tracing::error!(%error, "receive loop failed");
                    break;
                }
            };
            next = reader.read_bytes().promise();
            conn.dispatch(frame).run_detached();
        }
        conn.dispose();
        Ok(())
    })
    .run_detached();
}
