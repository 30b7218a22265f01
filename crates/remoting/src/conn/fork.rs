use crate::boot::{self, BootPayload};
use crate::conn::stream::StreamConnection;
use crate::hub::Hub;
use crate::importer::Importer;
use monad::{cont, Cont, Error, Result};
use process::{Process, ProcessOpts, ProcessPipe, Stdio};
use reactor::Reactor;

/// The peer executable expected to sit next to the current one.
pub fn default_peer_command() -> Result<Vec<String>> {
    let exe = std::env::current_exe()
        .map_err(|err| Error::value(format!("current executable is unknown: {err}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::value("current executable has no directory"))?;
    Ok(vec![dir.join("pretzel-peer").to_string_lossy().into_owned()])
}

/// Connection to a freshly spawned local peer process over a dedicated
/// pipe pair. The bootstrap payload goes over the child's stdin; the
/// pipes carry the framed traffic afterwards.
pub struct ForkConnection {
    stream: StreamConnection,
    process: Process,
}

impl Clone for ForkConnection {
    fn clone(&self) -> Self {
        ForkConnection {
            stream: self.stream.clone(),
            process: self.process.clone(),
        }
    }
}

impl ForkConnection {
    pub fn connect(
        command: Option<Vec<String>>,
        environ: Vec<(String, String)>,
        bufsize: Option<usize>,
        hub: &Hub,
        core: &Reactor,
    ) -> Cont<ForkConnection> {
        let hub = hub.clone();
        let core = core.clone();
        cont(async move {
            let stream = StreamConnection::new(&hub, &core);

            // Parent reads what the child writes, and vice versa. The
            // child ends survive exec; their numbers travel in the
            // bootstrap payload.
            let reader = ProcessPipe::new(true)?;
            let writer = ProcessPipe::new(false)?;

            let command = match command {
                Some(command) => command,
                None => default_peer_command()?,
            };
            let mut opts = ProcessOpts::new(command);
            opts.stdin = Stdio::Pipe;
            opts.kill_delay = None;
            let child = Process::spawn(opts, &core)?;
            let started = child.started();
            started.cont().await?;

            let mut payload = BootPayload::from_registry(&stream.conn().registry());
            payload.reader_fd = Some(writer.child_fd());
            payload.writer_fd = Some(reader.child_fd());
            payload.bufsize = bufsize.map(|size| size as u32);

            let stdin = child.stdin().expect("stdin is piped");
            boot::write_bootstrap(&stdin, &environ, &payload)?;
            stdin.flush_and_dispose().await?;

            let reader_stream = reader.into_parent_stream(&core, bufsize)?;
            let writer_stream = writer.into_parent_stream(&core, bufsize)?;
            stream.connect(reader_stream, writer_stream).await?;

            {
                let child = child.clone();
                stream.conn().add_disposal(move || child.dispose());
            }

            let importer = Importer::install(stream.conn()).await?;
            {
                let mut importer = importer;
                stream.conn().add_disposal(move || importer.dispose());
            }

            tracing::debug!(pid = child.pid(), "fork connection established");
            Ok(ForkConnection {
                stream,
                process: child,
            })
        })
    }

    pub fn conn(&self) -> &crate::Connection {
        self.stream.conn()
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn dispose(&self) {
        self.stream.dispose();
    }
}
