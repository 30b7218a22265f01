use crate::boot::{self, BootPayload};
use crate::conn::stream::StreamConnection;
use crate::hub::Hub;
use crate::importer::Importer;
use monad::{cont, Cont};
use process::{Process, ProcessOpts, Stdio};
use reactor::Reactor;

/// Connection over an arbitrary command whose stdin and stdout become
/// the transport; stderr is untouched. The command must end up
/// executing a peer binary, which length-reads the environment table
/// and bootstrap payload off its stdin before serving frames on the
/// same descriptors.
pub struct ShellConnection {
    stream: StreamConnection,
    process: Process,
}

impl Clone for ShellConnection {
    fn clone(&self) -> Self {
        ShellConnection {
            stream: self.stream.clone(),
            process: self.process.clone(),
        }
    }
}

impl ShellConnection {
    /// `command` is the transport prefix (possibly empty for a plain
    /// local peer); `peer_exec` the peer binary it should run.
    pub fn connect(
        mut command: Vec<String>,
        peer_exec: String,
        environ: Vec<(String, String)>,
        bufsize: Option<usize>,
        hub: &Hub,
        core: &Reactor,
    ) -> Cont<ShellConnection> {
        let hub = hub.clone();
        let core = core.clone();
        cont(async move {
            command.push(peer_exec);

            let stream = StreamConnection::new(&hub, &core);
            let mut opts = ProcessOpts::new(command);
            opts.stdin = Stdio::Pipe;
            opts.stdout = Stdio::Pipe;
            opts.bufsize = bufsize;
            opts.kill_delay = None;
            let child = Process::spawn(opts, &core)?;
            let started = child.started();
            started.cont().await?;

            let mut payload = BootPayload::from_registry(&stream.conn().registry());
            payload.bufsize = bufsize.map(|size| size as u32);

            // The bootstrap rides ahead of the framed traffic on the
            // same descriptor, so the stdin stream stays open.
            let stdin = child.stdin().expect("stdin is piped");
            boot::write_bootstrap(&stdin, &environ, &payload)?;
            stdin.flush().await?;

            let stdout = child.stdout().expect("stdout is piped");
            stream.connect(stdout, stdin).await?;

            {
                let child = child.clone();
                stream.conn().add_disposal(move || child.dispose());
            }
            let importer = Importer::install(stream.conn()).await?;
            {
                let mut importer = importer;
                stream.conn().add_disposal(move || importer.dispose());
            }

            tracing::debug!(pid = child.pid(), "shell connection established");
            Ok(ShellConnection {
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
