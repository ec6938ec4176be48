//! Target transport.
//!
//! A [`Transport`] carries whole debug frames between the client and the
//! target over some reliable, ordered byte channel. The trait is the seam
//! between the dispatcher and the outside world: the production
//! implementation is TCP, tests substitute scripted mocks, and a serial
//! link would slot in the same way.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tether_protocol::{FrameHeader, FRAME_HEADER_LEN};
use tracing::{debug, trace};

use crate::error::{DebugError, Result};

/// Reliable, ordered, whole-frame channel to the target.
///
/// ## Contract
///
/// - `send` writes one complete frame or fails.
/// - `receive` blocks until a complete frame arrives, the timeout elapses
///   (`Timeout`, distinct from connection loss), or the channel is closed.
/// - `close` may be called from any thread and unblocks a pending
///   `receive` with `Closed` rather than leaking the waiter.
///
/// Implementations take `&self`: the dispatcher's receiver thread reads
/// while client threads send.
pub trait Transport: Send + Sync
{
    /// Send one encoded frame.
    ///
    /// ## Errors
    ///
    /// `Closed` after [`Transport::close`]; `Connection` on transport
    /// failure.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive one complete frame, blocking up to `timeout` (forever when
    /// `None`).
    ///
    /// ## Errors
    ///
    /// `Timeout` when the deadline passes with the target silent; `Closed`
    /// after [`Transport::close`]; `Connection` when the target is gone;
    /// `Wire`/`Protocol` when the stream contents cannot be framed.
    fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Close the channel, waking any blocked `receive`.
    fn close(&self);
}

/// TCP implementation of [`Transport`].
///
/// The endpoint is a `host:port` string. Frames are delimited by the
/// fixed-size protocol header: the reader pulls the header, sanity-checks
/// magic and length, then pulls exactly the advertised payload.
pub struct TcpTransport
{
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl TcpTransport
{
    /// Connect to a target endpoint.
    ///
    /// ## Errors
    ///
    /// `Connection` when the endpoint is unreachable or refuses.
    pub fn connect(endpoint: &str) -> Result<Self>
    {
        let stream = TcpStream::connect(endpoint)
            .map_err(|err| DebugError::Connection(format!("connect {endpoint}: {err}")))?;
        // Frames are small and latency matters more than throughput.
        let _ = stream.set_nodelay(true);
        let reader = stream
            .try_clone()
            .map_err(|err| DebugError::Connection(format!("clone stream: {err}")))?;
        debug!(endpoint, "connected to target");
        Ok(TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            closed: AtomicBool::new(false),
        })
    }

    fn map_io_error(&self, err: &io::Error, timeout: Option<Duration>) -> DebugError
    {
        if self.closed.load(Ordering::SeqCst) {
            return DebugError::Closed;
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                DebugError::Timeout(timeout.unwrap_or(Duration::ZERO))
            }
            _ => DebugError::Connection(err.to_string()),
        }
    }
}

impl Transport for TcpTransport
{
    fn send(&self, frame: &[u8]) -> Result<()>
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DebugError::Closed);
        }
        let mut writer = self.writer.lock().map_err(|_| DebugError::Closed)?;
        writer
            .write_all(frame)
            .and_then(|()| writer.flush())
            .map_err(|err| self.map_io_error(&err, None))?;
        trace!(len = frame.len(), "frame sent");
        Ok(())
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>>
    {
        let mut reader = self.reader.lock().map_err(|_| DebugError::Closed)?;
        reader
            .set_read_timeout(timeout)
            .map_err(|err| DebugError::Connection(err.to_string()))?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|err| self.map_io_error(&err, timeout))?;

        // Bad magic or an absurd length means the stream is desynchronized;
        // surface it as a wire error and let the dispatcher count it.
        let parsed = FrameHeader::parse(&header)?;

        let mut frame = vec![0u8; FRAME_HEADER_LEN + parsed.payload_len as usize];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&header);
        reader
            .read_exact(&mut frame[FRAME_HEADER_LEN..])
            .map_err(|err| self.map_io_error(&err, timeout))?;
        trace!(len = frame.len(), kind = parsed.kind, "frame received");
        Ok(frame)
    }

    fn close(&self)
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing transport");
        // Shutdown unblocks a read_exact pending in another thread.
        if let Ok(reader) = self.reader.try_lock() {
            let _ = reader.shutdown(Shutdown::Both);
        } else if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}
