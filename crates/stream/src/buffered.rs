use crate::buffer::Buffer;
use crate::stream::{Guard, Stream};
use bytes::{BufMut, Bytes, BytesMut};
use monad::{cont, Cont, Error, Promise, Result};
use std::cell::RefCell;
use std::ops::Range;
use std::os::fd::RawFd;
use std::rc::Rc;

struct Inner {
    base: Rc<dyn Stream>,
    bufsize: usize,
    read_buffer: RefCell<Buffer>,
    write_buffer: RefCell<Buffer>,
    reading: Guard,
    writing: Guard,
    flushing: RefCell<Option<Promise<()>>>,
}

/// Buffered wrapper over a base byte stream.
///
/// Reads refill from the base in `bufsize` chunks and serve pattern
/// requests out of the rope buffer; writes coalesce into the write
/// buffer and drain through a singleton flush task.
pub struct BufferedStream {
    inner: Rc<Inner>,
}

impl Clone for BufferedStream {
    fn clone(&self) -> Self {
        BufferedStream {
            inner: self.inner.clone(),
        }
    }
}

impl BufferedStream {
    pub fn new(base: Rc<dyn Stream>, bufsize: Option<usize>) -> BufferedStream {
        BufferedStream {
            inner: Rc::new(Inner {
                base,
                bufsize: bufsize.unwrap_or_else(common::bufsize),
                read_buffer: RefCell::new(Buffer::new()),
                write_buffer: RefCell::new(Buffer::new()),
                reading: Guard::new("read"),
                writing: Guard::new("write"),
                flushing: RefCell::new(None),
            }),
        }
    }

    pub fn bufsize(&self) -> usize {
        self.inner.bufsize
    }

    async fn refill(inner: &Rc<Inner>) -> Result<()> {
        let data = inner.base.read(inner.bufsize).await?;
        inner.read_buffer.borrow_mut().enqueue(data);
        Ok(())
    }

    /// Up to `size` bytes, refilling from the base once if the buffer
    /// is empty.
    pub fn read(&self, size: usize) -> Cont<Bytes> {
        let inner = self.inner.clone();
        cont(async move {
            if size == 0 {
                return Ok(Bytes::new());
            }
            let _held = inner.reading.enter()?;
            if inner.read_buffer.borrow().is_empty() {
                Self::refill(&inner).await?;
            }
            Ok(inner.read_buffer.borrow_mut().dequeue(size))
        })
    }

    /// Exactly `size` bytes.
    pub fn read_until_size(&self, size: usize) -> Cont<Bytes> {
        let inner = self.inner.clone();
        cont(async move {
            if size == 0 {
                return Ok(Bytes::new());
            }
            let _held = inner.reading.enter()?;
            while inner.read_buffer.borrow().len() < size {
                Self::refill(&inner).await?;
            }
            Ok(inner.read_buffer.borrow_mut().dequeue(size))
        })
    }

    /// Everything until the base reports end of stream.
    pub fn read_until_eof(&self) -> Cont<Bytes> {
        let inner = self.inner.clone();
        cont(async move {
            let _held = inner.reading.enter()?;
            loop {
                match inner.base.read(inner.bufsize).await {
                    Ok(data) => inner.read_buffer.borrow_mut().enqueue(data),
                    Err(error) if error.is_broken_pipe() => break,
                    Err(error) => return Err(error),
                }
            }
            Ok(inner.read_buffer.borrow_mut().dequeue_all())
        })
    }

    /// The shortest prefix ending with `sep`, separator included.
    pub fn read_until_sub(&self, sep: &[u8]) -> Cont<Bytes> {
        let inner = self.inner.clone();
        let sep = if sep.is_empty() {
            Bytes::from_static(b"\n")
        } else {
            Bytes::copy_from_slice(sep)
        };
        cont(async move {
            let _held = inner.reading.enter()?;
            // Resume the scan where the previous round left off; a
            // separator can straddle the refill boundary.
            let mut offset = 0;
            let found = loop {
                let data = inner.read_buffer.borrow_mut().slice_all();
                if let Some(at) = find(&data[offset..], &sep) {
                    break offset + at;
                }
                offset = data.len().saturating_sub(sep.len() - 1);
                Self::refill(&inner).await?;
            };
            Ok(inner
                .read_buffer
                .borrow_mut()
                .dequeue(found + sep.len()))
        })
    }

    /// The shortest prefix containing a match of `regex`; resolves
    /// with the prefix and the match span within it.
    pub fn read_until_regex(&self, regex: regex::bytes::Regex) -> Cont<(Bytes, Range<usize>)> {
        let inner = self.inner.clone();
        cont(async move {
            let _held = inner.reading.enter()?;
            let span = loop {
                let data = inner.read_buffer.borrow_mut().slice_all();
                if let Some(found) = regex.find(&data) {
                    break found.start()..found.end();
                }
                Self::refill(&inner).await?;
            };
            Ok((
                inner.read_buffer.borrow_mut().dequeue(span.end),
                span,
            ))
        })
    }

    /// A length-prefixed payload: big-endian 4-byte length, then
    /// exactly that many bytes.
    pub fn read_bytes(&self) -> Cont<Bytes> {
        let this = self.clone();
        cont(async move {
            let header = this.read_until_size(4).await?;
            let length = u32::from_be_bytes(header[..].try_into().expect("4 bytes")) as usize;
            this.read_until_size(length).await
        })
    }

    /// Enqueue `data`. A write buffer beyond twice the chunk size
    /// suspends until drained; beyond the chunk size it starts a
    /// background flush.
    pub fn write(&self, data: Bytes) -> Cont<usize> {
        let this = self.clone();
        cont(async move {
            let size = data.len();
            let buffered = {
                let mut buffer = this.inner.write_buffer.borrow_mut();
                buffer.enqueue(data);
                buffer.len()
            };
            if buffered > 2 * this.inner.bufsize {
                this.flush().await?;
            } else if buffered > this.inner.bufsize {
                this.flush().run_detached();
            }
            Ok(size)
        })
    }

    /// Pure enqueue: no size checks, no flush. The caller flushes.
    pub fn write_schedule(&self, data: Bytes) -> usize {
        let size = data.len();
        self.inner.write_buffer.borrow_mut().enqueue(data);
        size
    }

    /// Enqueue a length-prefixed payload. The caller flushes.
    pub fn write_bytes(&self, data: Bytes) {
        let mut header = BytesMut::with_capacity(4);
        header.put_u32(data.len() as u32);
        self.write_schedule(header.freeze());
        self.write_schedule(data);
    }

    /// Singleton flush: drain the write buffer to the base in chunk
    /// slices, then flush the base. A flush requested while one is
    /// running attaches to the running one.
    pub fn flush(&self) -> Cont<()> {
        if let Some(running) = self.inner.flushing.borrow().as_ref() {
            if !running.completed() {
                return running.cont();
            }
        }
        let inner = self.inner.clone();
        let promise = cont(async move {
            let _held = inner.writing.enter()?;
            loop {
                let block = {
                    let mut buffer = inner.write_buffer.borrow_mut();
                    if buffer.is_empty() {
                        break;
                    }
                    buffer.slice(inner.bufsize)
                };
                let wrote = inner.base.write(block).await?;
                inner.write_buffer.borrow_mut().advance(wrote);
            }
            inner.base.flush().await
        })
        .promise();
        *self.inner.flushing.borrow_mut() = Some(promise.clone());
        promise.cont()
    }

    pub fn flush_and_dispose(&self) -> Cont<()> {
        let this = self.clone();
        cont(async move {
            let flushed = this.flush().await;
            this.dispose();
            flushed
        })
    }

    pub fn base(&self) -> Rc<dyn Stream> {
        self.inner.base.clone()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Stream for BufferedStream {
    fn read(&self, max: usize) -> Cont<Bytes> {
        BufferedStream::read(self, max)
    }

    fn write(&self, data: Bytes) -> Cont<usize> {
        BufferedStream::write(self, data)
    }

    fn flush(&self) -> Cont<()> {
        BufferedStream::flush(self)
    }

    fn dispose(&self) {
        self.inner.base.dispose();
    }

    fn disposed(&self) -> bool {
        self.inner.base.disposed()
    }

    fn fd(&self) -> Option<RawFd> {
        self.inner.base.fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    /// In-memory scripted base stream: reads serve queued chunks,
    /// writes record every payload and honour a partial-write cap.
    struct Scripted {
        reads: RefCell<std::collections::VecDeque<Bytes>>,
        writes: RefCell<Vec<Bytes>>,
        write_cap: Cell<usize>,
        disposed: Cell<bool>,
    }

    impl Scripted {
        fn new(reads: &[&'static [u8]]) -> Rc<Scripted> {
            Rc::new(Scripted {
                reads: RefCell::new(reads.iter().map(|data| Bytes::from_static(data)).collect()),
                writes: RefCell::new(Vec::new()),
                write_cap: Cell::new(usize::MAX),
                disposed: Cell::new(false),
            })
        }

        fn written(&self) -> Bytes {
            let mut all = BytesMut::new();
            for chunk in self.writes.borrow().iter() {
                all.extend_from_slice(chunk);
            }
            all.freeze()
        }
    }

    impl Stream for Scripted {
        fn read(&self, max: usize) -> Cont<Bytes> {
            let mut reads = self.reads.borrow_mut();
            match reads.pop_front() {
                Some(mut chunk) => {
                    if chunk.len() > max {
                        let rest = chunk.split_off(max);
                        reads.push_front(rest);
                    }
                    Cont::unit(chunk)
                }
                None => Cont::error(Error::broken_pipe("script exhausted")),
            }
        }

        fn write(&self, mut data: Bytes) -> Cont<usize> {
            let cap = self.write_cap.get();
            if data.len() > cap {
                data.truncate(cap);
            }
            let n = data.len();
            self.writes.borrow_mut().push(data);
            Cont::unit(n)
        }

        fn flush(&self) -> Cont<()> {
            Cont::unit(())
        }

        fn dispose(&self) {
            self.disposed.set(true);
        }

        fn disposed(&self) -> bool {
            self.disposed.get()
        }
    }

    fn outcome<T: Clone + 'static>(cont: Cont<T>) -> Result<T> {
        let promise = cont.promise();
        promise.result().expect("scripted streams resolve inline")
    }

    #[test]
    fn test_read_until_size_spans_chunks() {
        let base = Scripted::new(&[b"01", b"2345", b"6789"]);
        let stream = BufferedStream::new(base, Some(4));
        assert_eq!(
            outcome(stream.read_until_size(7)).unwrap(),
            Bytes::from_static(b"0123456")
        );
        assert_eq!(
            outcome(stream.read(16)).unwrap(),
            Bytes::from_static(b"789")
        );
    }

    #[test]
    fn test_read_until_eof_collects_everything() {
        let base = Scripted::new(&[b"abc", b"def"]);
        let stream = BufferedStream::new(base, Some(4));
        assert_eq!(
            outcome(stream.read_until_eof()).unwrap(),
            Bytes::from_static(b"abcdef")
        );
    }

    #[test]
    fn test_read_until_sub_returns_shortest_prefix() {
        let base = Scripted::new(&[b"one\ntwo", b"\nthree"]);
        let stream = BufferedStream::new(base, Some(16));
        assert_eq!(
            outcome(stream.read_until_sub(b"\n")).unwrap(),
            Bytes::from_static(b"one\n")
        );
        assert_eq!(
            outcome(stream.read_until_sub(b"\n")).unwrap(),
            Bytes::from_static(b"two\n")
        );
    }

    #[test]
    fn test_read_until_sub_straddles_refills() {
        let base = Scripted::new(&[b"ab<", b">cd"]);
        let stream = BufferedStream::new(base, Some(4));
        assert_eq!(
            outcome(stream.read_until_sub(b"<>")).unwrap(),
            Bytes::from_static(b"ab<>")
        );
    }

    #[test]
    fn test_read_until_regex_reports_span() {
        let base = Scripted::new(&[b"hdr 123", b"4 tail"]);
        let stream = BufferedStream::new(base, Some(4));
        let regex = regex::bytes::Regex::new(r"\d+ ").unwrap();
        let (data, span) = outcome(stream.read_until_regex(regex)).unwrap();
        assert_eq!(data, Bytes::from_static(b"hdr 1234 "));
        assert_eq!(span, 4..9);
        assert_eq!(&data[span], b"1234 ".as_slice());
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let base = Scripted::new(&[]);
        let stream = BufferedStream::new(base.clone(), Some(8));
        stream.write_bytes(Bytes::from_static(b"payload"));
        outcome(stream.flush()).unwrap();

        let written = base.written();
        assert_eq!(&written[..4], &7u32.to_be_bytes());
        assert_eq!(&written[4..], b"payload");
    }

    #[test]
    fn test_flush_preserves_submission_order_under_partial_writes() {
        let base = Scripted::new(&[]);
        base.write_cap.set(3);
        let stream = BufferedStream::new(base.clone(), Some(4));
        stream.write_schedule(Bytes::from_static(b"hello "));
        stream.write_schedule(Bytes::from_static(b"world"));
        outcome(stream.flush()).unwrap();
        assert_eq!(base.written(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_concurrent_flushes_share_one_task() {
        let base = Scripted::new(&[]);
        let stream = BufferedStream::new(base.clone(), Some(4));
        stream.write_schedule(Bytes::from_static(b"abcdefgh"));
        let first = stream.flush();
        let second = stream.flush();
        outcome(first).unwrap();
        outcome(second).unwrap();
        assert_eq!(base.written(), Bytes::from_static(b"abcdefgh"));
    }
}
