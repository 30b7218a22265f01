use crate::buffered::BufferedStream;
use crate::file::File;
use crate::stream::Stream;
use monad::{cont, Cont, Error, Result};
use reactor::{Reactor, POLL_READ};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{IntoRawFd, RawFd};
use std::rc::Rc;

/// TCP stream: a connected socket as an asynchronous stream.
pub struct Socket {
    file: File,
    peer: Option<SocketAddr>,
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        Socket {
            file: self.file.clone(),
            peer: self.peer,
        }
    }
}

impl Socket {
    /// Wrap a connected socket, switching it to non-blocking mode.
    pub fn from_std(sock: TcpStream, core: &Reactor) -> Result<Socket> {
        let peer = sock.peer_addr().ok();
        let file = File::new(sock.into_raw_fd(), true, core)?;
        Ok(Socket { file, peer })
    }

    /// Connect to `addr`. Name resolution and the TCP handshake happen
    /// synchronously; the established socket is then driven by the
    /// reactor.
    pub fn connect(addr: impl ToSocketAddrs, core: &Reactor) -> Result<Socket> {
        let sock = TcpStream::connect(addr)
            .map_err(|err| Error::connection(format!("connect: {err}")))?;
        Socket::from_std(sock, core)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.raw_fd()
    }

    /// Buffered wrapper around this socket.
    pub fn buffered(self, bufsize: Option<usize>) -> BufferedStream {
        BufferedStream::new(Rc::new(self), bufsize)
    }
}

impl Stream for Socket {
    fn read(&self, max: usize) -> Cont<bytes::Bytes> {
        self.file.read(max)
    }

    fn write(&self, data: bytes::Bytes) -> Cont<usize> {
        self.file.write(data)
    }

    fn flush(&self) -> Cont<()> {
        self.file.flush()
    }

    fn dispose(&self) {
        self.file.dispose();
    }

    fn disposed(&self) -> bool {
        self.file.disposed()
    }

    fn fd(&self) -> Option<RawFd> {
        self.file.fd()
    }
}

/// TCP listener with asynchronous accept.
pub struct Listener {
    listener: TcpListener,
    core: Reactor,
}

impl Listener {
    pub fn bind(addr: impl ToSocketAddrs, core: &Reactor) -> Result<Listener> {
        let listener =
            TcpListener::bind(addr).map_err(|err| Error::connection(format!("bind: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| Error::connection(format!("set_nonblocking: {err}")))?;
        Ok(Listener {
            listener,
            core: core.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|err| Error::connection(format!("local_addr: {err}")))
    }

    pub fn accept(&self) -> Cont<(Socket, SocketAddr)> {
        let listener = self
            .listener
            .try_clone()
            .map_err(|err| Error::connection(format!("listener clone: {err}")));
        let core = self.core.clone();
        cont(async move {
            let listener = listener?;
            let fd = std::os::fd::AsRawFd::as_raw_fd(&listener);
            loop {
                match listener.accept() {
                    Ok((sock, addr)) => {
                        sock.set_nonblocking(true)
                            .map_err(|err| Error::connection(format!("accept: {err}")))?;
                        return Ok((Socket::from_std(sock, &core)?, addr));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err.into()),
                }
                core.poll_fd(fd, POLL_READ).await?;
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_accept_and_echo() {
        let core = Reactor::new().unwrap();
        let listener = Listener::bind("127.0.0.1:0", &core).unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = listener.accept().promise();
        let client = Socket::connect(addr, &core).unwrap();

        let (server, _peer) = core.run_until(&accepted).unwrap();
        let read = server.read(64).promise();
        let write = client.write(Bytes::from_static(b"hello")).promise();
        assert_eq!(core.run_until(&write).unwrap(), 5);
        assert_eq!(core.run_until(&read).unwrap(), Bytes::from_static(b"hello"));
        core.dispose();
    }
}
