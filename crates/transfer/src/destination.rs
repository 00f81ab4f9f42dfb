//! Where committed bytes go.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

/// A caller-supplied stream the writer can commit into.
///
/// The writer seeks to each chunk's offset before writing, and on resume
/// reads back the already-written prefix to rebuild the digest.
pub trait DestinationStream: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {
    /// Whether the stream accepts writes.
    fn can_write(&self) -> bool {
        true
    }

    /// Whether the stream supports random-access seeks.
    fn can_seek(&self) -> bool {
        true
    }
}

impl DestinationStream for tokio::fs::File {}

/// Destination descriptor for a job.
pub enum Destination {
    /// A file the writer opens, pre-sizes and closes itself.
    Path(PathBuf),
    /// A stream owned by the caller. The writer flushes it but never shuts
    /// it down.
    Stream(Box<dyn DestinationStream>),
}

impl Destination {
    /// Wraps a caller-owned stream.
    pub fn stream(stream: impl DestinationStream + 'static) -> Self {
        Destination::Stream(Box::new(stream))
    }

    /// Short description used for job labels and logs.
    pub fn describe(&self) -> String {
        match self {
            Destination::Path(path) => path.display().to_string(),
            Destination::Stream(_) => "<stream>".into(),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Destination::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<PathBuf> for Destination {
    fn from(path: PathBuf) -> Self {
        Destination::Path(path)
    }
}

/// In-memory destination backed by a shared buffer.
///
/// Clones share the same bytes but keep independent cursors, so the caller
/// can keep one handle and give another to the writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    shared: Arc<Mutex<MemoryInner>>,
    position: u64,
    writable: bool,
    seekable: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    shut_down: bool,
}

impl MemoryDestination {
    /// An empty, writable and seekable destination.
    pub fn new() -> Self {
        Self::with_contents(Vec::new())
    }

    /// A destination pre-filled with `data`, e.g. bytes left by an earlier run.
    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MemoryInner {
                data,
                shut_down: false,
            })),
            position: 0,
            writable: true,
            seekable: true,
        }
    }

    /// A handle to the same bytes that refuses writes.
    pub fn read_only(&self) -> Self {
        Self {
            writable: false,
            ..self.clone()
        }
    }

    /// A handle to the same bytes that cannot seek.
    pub fn sequential(&self) -> Self {
        Self {
            seekable: false,
            ..self.clone()
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.shared.lock().unwrap().data.clone()
    }

    /// Returns `true` once any handle has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().unwrap().shut_down
    }
}

impl DestinationStream for MemoryDestination {
    fn can_write(&self) -> bool {
        self.writable
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }
}

impl AsyncRead for MemoryDestination {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let inner = this.shared.lock().unwrap();
        let start = (this.position as usize).min(inner.data.len());
        let n = buf.remaining().min(inner.data.len() - start);
        buf.put_slice(&inner.data[start..start + n]);
        this.position += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemoryDestination {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.writable {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "destination is read-only",
            )));
        }
        let mut inner = this.shared.lock().unwrap();
        let start = this.position as usize;
        let end = start + buf.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(buf);
        this.position = end as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.lock().unwrap().shut_down = true;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemoryDestination {
    fn start_seek(self: Pin<&mut Self>, pos: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if !this.seekable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "destination is not seekable",
            ));
        }
        let len = this.shared.lock().unwrap().data.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => this.position as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of destination",
            ));
        }
        this.position = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
