//! Bootstrap payload: the blob a transport ships to a freshly spawned
//! peer before the framed handshake. The peer length-reads the
//! environment table and then the payload from its stdin, installs
//! both, and starts serving.

use crate::registry::{ModuleRecord, Registry};
use bytes::{BufMut, Bytes, BytesMut};
use monad::{Error, Result};
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use stream::BufferedStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootPayload {
    /// Shippable modules installed before the connection starts.
    pub modules: Vec<ModuleRecord>,
    /// Seed entries for the peer connection's module map.
    pub module_map: Vec<(String, String)>,
    /// Transport descriptors on the peer side; stdin/stdout when
    /// absent (the shell transport).
    pub reader_fd: Option<i32>,
    pub writer_fd: Option<i32>,
    pub bufsize: Option<u32>,
}

impl BootPayload {
    /// Collect every shippable module registered locally.
    pub fn from_registry(registry: &Registry) -> BootPayload {
        BootPayload {
            modules: registry.records(),
            module_map: Vec::new(),
            reader_fd: None,
            writer_fd: None,
            bufsize: None,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    postcard::to_stdvec(value)
        .map(Bytes::from)
        .map_err(|err| Error::value(format!("bootstrap encoding failed: {err}")))
}

/// Queue the environment table and payload onto `stream`, each behind
/// a 4-byte big-endian length prefix. The caller flushes.
pub fn write_bootstrap(
    stream: &BufferedStream,
    environ: &[(String, String)],
    payload: &BootPayload,
) -> Result<()> {
    stream.write_bytes(encode(&environ.to_vec())?);
    stream.write_bytes(encode(payload)?);
    Ok(())
}

fn read_exact_fd(fd: RawFd, buffer: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        // Safety: reading into the live remainder of the buffer. The
        // descriptor is still in blocking mode at bootstrap time.
        let n = unsafe {
            libc::read(
                fd,
                buffer[filled..].as_mut_ptr() as *mut libc::c_void,
                buffer.len() - filled,
            )
        };
        if n == 0 {
            return Err(Error::broken_pipe("bootstrap payload is incomplete"));
        }
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        filled += n as usize;
    }
    Ok(())
}

fn read_blob_fd(fd: RawFd) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    read_exact_fd(fd, &mut header)?;
    let length = u32::from_be_bytes(header) as usize;
    let mut blob = vec![0u8; length];
    read_exact_fd(fd, &mut blob)?;
    Ok(blob)
}

/// Blocking read of the bootstrap from `fd` (the spawned peer's
/// stdin), done before any reactor exists. Reads are unbuffered so the
/// framed traffic that follows stays in the kernel for the stream
/// layer.
pub fn read_bootstrap(fd: RawFd) -> Result<(Vec<(String, String)>, BootPayload)> {
    let environ = read_blob_fd(fd)?;
    let environ: Vec<(String, String)> = postcard::from_bytes(&environ)
        .map_err(|err| Error::value(format!("environment decoding failed: {err}")))?;
    let payload = read_blob_fd(fd)?;
    let payload: BootPayload = postcard::from_bytes(&payload)
        .map_err(|err| Error::value(format!("bootstrap decoding failed: {err}")))?;
    Ok((environ, payload))
}

/// The two length-prefixed blobs as raw bytes, for tests and for
/// transports that stage the write themselves.
pub fn bootstrap_bytes(environ: &[(String, String)], payload: &BootPayload) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for blob in [encode(&environ.to_vec())?, encode(payload)?] {
        out.put_u32(blob.len() as u32);
        out.extend_from_slice(&blob);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bootstrap_round_trip_through_a_pipe() {
        let payload = BootPayload {
            modules: Vec::new(),
            module_map: vec![("__main__".into(), "app".into())],
            reader_fd: Some(7),
            writer_fd: Some(8),
            bufsize: Some(4096),
        };
        let environ = vec![("PRETZEL_BUFSIZE".to_string(), "4096".to_string())];
        let blob = bootstrap_bytes(&environ, &payload).unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let written = unsafe {
            libc::write(fds[1], blob.as_ptr() as *const libc::c_void, blob.len())
        };
        assert_eq!(written as usize, blob.len());

        let (environ_read, payload_read) = read_bootstrap(fds[0]).unwrap();
        assert_eq!(environ_read, environ);
        assert_eq!(payload_read, payload);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_truncated_bootstrap_is_broken_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let partial = [0u8, 0, 0, 9, 1, 2];
        unsafe {
            libc::write(fds[1], partial.as_ptr() as *const libc::c_void, partial.len());
            libc::close(fds[1]);
        }
        let err = read_bootstrap(fds[0]).unwrap_err();
        assert!(err.is_broken_pipe());
        unsafe { libc::close(fds[0]) };
    }
}
