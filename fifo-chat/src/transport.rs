//! Byte transport between the broker and its clients.
//!
//! The broker reads frames from one [`Inbox`] and writes them to recipients
//! through an [`Outbox`]. Both are implemented over named FIFOs here; tests
//! substitute in-memory doubles.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::BytesMut;
use nix::{errno::Errno, sys::stat::Mode, unistd::mkfifo};
use thiserror::Error;
use tokio::{io::AsyncReadExt, net::unix::pipe};
use tracing::debug;

use crate::frame::{FRAME_SIZE, Frame};

/// A channel the owner reads frames from.
#[async_trait]
pub trait Inbox: Send {
    /// Waits for the next chunk of at most one frame.
    ///
    /// `Ok(None)` means every writer has gone away.
    async fn recv(&mut self) -> io::Result<Option<BytesMut>>;

    /// Reopens the underlying channel after all writers left.
    fn reopen(&mut self) -> io::Result<()>;

    /// Releases the channel. Nothing can be read afterwards.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Delivery to a recipient's private inbox. Implementations must never block.
pub trait Outbox {
    fn deliver(&mut self, address: &str, frame: &Frame) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("inbox {address} is not accepting writes: {source}")]
    Unavailable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("short write to {address}: {written} of {expected} bytes")]
    ShortWrite {
        address: String,
        written: usize,
        expected: usize,
    },
}

/// Named FIFO read by its owner.
///
/// The inbox keeps a write handle on its own FIFO, so reads keep blocking
/// instead of reporting end-of-stream while no outside writer is attached.
#[derive(Debug)]
pub struct FifoInbox {
    path: PathBuf,
    receiver: pipe::Receiver,
    _keepalive: pipe::Sender,
}

impl FifoInbox {
    /// Creates the FIFO at `path` unless it already exists, then opens it.
    /// Must be called from within a Tokio runtime.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        make_fifo(&path)?;
        let (receiver, keepalive) = open_fifo(&path)?;
        Ok(Self {
            path,
            receiver,
            _keepalive: keepalive,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Inbox for FifoInbox {
    async fn recv(&mut self) -> io::Result<Option<BytesMut>> {
        let mut buf = BytesMut::zeroed(FRAME_SIZE);
        let read = self.receiver.read(&mut buf[..]).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }

    fn reopen(&mut self) -> io::Result<()> {
        make_fifo(&self.path)?;
        let (receiver, keepalive) = open_fifo(&self.path)?;
        self.receiver = receiver;
        self._keepalive = keepalive;
        debug!(path = %self.path.display(), "fifo reopened");
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        let FifoInbox { path, receiver, _keepalive } = self;
        drop(receiver);
        drop(_keepalive);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Writes frames to client FIFOs, opening each one per delivery.
///
/// Both the open and the write are non-blocking: a FIFO with no reader fails
/// to open and a full FIFO rejects the write instead of waiting for space.
/// Anything that is not a FIFO is refused. Must be called from within a Tokio
/// runtime.
#[derive(Debug, Default)]
pub struct FifoOutbox;

impl Outbox for FifoOutbox {
    fn deliver(&mut self, address: &str, frame: &Frame) -> Result<(), DeliveryError> {
        let unavailable = |source: io::Error| DeliveryError::Unavailable {
            address: address.to_string(),
            source,
        };

        let sender = pipe::OpenOptions::new()
            .open_sender(address)
            .map_err(unavailable)?;
        // Write straight to the descriptor; the reactor has not seen this
        // pipe become writable yet.
        let mut fifo = File::from(sender.into_nonblocking_fd().map_err(unavailable)?);
        let encoded = frame.encode();
        let written = fifo.write(&encoded).map_err(unavailable)?;
        if written != encoded.len() {
            return Err(DeliveryError::ShortWrite {
                address: address.to_string(),
                written,
                expected: encoded.len(),
            });
        }
        Ok(())
    }
}

/// Whether opening a FIFO for writing failed only because no reader exists yet.
pub fn is_reader_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ENXIO as i32)
}

fn make_fifo(path: &Path) -> io::Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

fn open_fifo(path: &Path) -> io::Result<(pipe::Receiver, pipe::Sender)> {
    // The reader must exist before a non-blocking writer can open.
    let receiver = pipe::OpenOptions::new().open_receiver(path)?;
    let keepalive = pipe::OpenOptions::new().open_sender(path)?;
    Ok((receiver, keepalive))
}
