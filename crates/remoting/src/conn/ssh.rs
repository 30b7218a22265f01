use crate::conn::shell::ShellConnection;
use crate::hub::Hub;
use monad::Cont;
use reactor::Reactor;

/// Connection to a peer on a remote host over ssh. Authentication and
/// encryption are the transport command's business: pseudo-tty
/// allocation is disabled and interactive password prompts are turned
/// off, so a failing key setup fails the connection instead of
/// hanging it.
pub struct SshOpts {
    pub host: String,
    pub port: Option<u16>,
    pub identity: Option<String>,
    pub ssh_exec: String,
    /// Peer binary to invoke on the remote host.
    pub peer_exec: String,
}

impl SshOpts {
    pub fn new(host: impl Into<String>) -> SshOpts {
        SshOpts {
            host: host.into(),
            port: None,
            identity: None,
            ssh_exec: "ssh".to_string(),
            peer_exec: "pretzel-peer".to_string(),
        }
    }

    fn command(&self) -> Vec<String> {
        let mut command = vec![
            self.ssh_exec.clone(),
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.identity {
            command.push("-i".to_string());
            command.push(identity.clone());
        }
        if let Some(port) = self.port {
            command.push("-p".to_string());
            command.push(port.to_string());
        }
        command.push(self.host.clone());
        command
    }
}

#[derive(Clone)]
pub struct SshConnection {
    shell: ShellConnection,
}

impl SshConnection {
    pub fn connect(
        opts: SshOpts,
        environ: Vec<(String, String)>,
        bufsize: Option<usize>,
        hub: &Hub,
        core: &Reactor,
    ) -> Cont<SshConnection> {
        let command = opts.command();
        let peer_exec = opts.peer_exec.clone();
        ShellConnection::connect(command, peer_exec, environ, bufsize, hub, core)
            .map(|shell| SshConnection { shell })
    }

    pub fn conn(&self) -> &crate::Connection {
        self.shell.conn()
    }

    pub fn dispose(&self) {
        self.shell.dispose();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_command_line_defaults() {
        let mut opts = SshOpts::new("worker-3");
        opts.port = Some(2200);
        opts.identity = Some("/home/u/.ssh/id".to_string());
        assert_eq!(
            opts.command(),
            vec![
                "ssh",
                "-T",
                "-o",
                "BatchMode=yes",
                "-i",
                "/home/u/.ssh/id",
                "-p",
                "2200",
                "worker-3",
            ]
        );
    }
}
