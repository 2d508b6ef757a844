//! Length-prefixed bincode framing over a TCP stream.
//!
//! Each frame is a 4-byte big-endian length followed by the bincode
//! encoding of one [`Envelope`]. Receiving ends run their stream in
//! non-blocking mode and accumulate partial reads in a buffer until a
//! whole frame is available.

use crate::error::{ApexError, Result};
use crate::messages::Envelope;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Frames larger than this are treated as corrupt rather than allocated.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A TCP stream with frame-level send/receive.
#[derive(Debug)]
pub struct FramedStream {
    stream: TcpStream,
    read_buf: Vec<u8>,
    eof: bool,
}

impl FramedStream {
    /// Wrap a connected stream. `nonblocking` should be true on receiving
    /// ends so polls never stall the actor loop.
    pub fn new(stream: TcpStream, nonblocking: bool) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(nonblocking)?;
        Ok(Self {
            stream,
            read_buf: Vec::new(),
            eof: false,
        })
    }

    /// Send one envelope. Blocks until the frame is fully written.
    pub fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let body = bincode::serialize(envelope)?;
        let len = u32::try_from(body.len())
            .map_err(|_| ApexError::Codec("frame exceeds u32 length".into()))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&body)?;
        Ok(())
    }

    /// Poll for one envelope without blocking.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet, and
    /// `Err` when the peer has closed and every buffered frame has been
    /// consumed. Frames sent just before a close are still delivered.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>> {
        self.fill_buffer()?;
        if let Some(envelope) = self.pop_frame()? {
            return Ok(Some(envelope));
        }
        if self.eof {
            return Err(ApexError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "peer closed connection",
            )));
        }
        Ok(None)
    }

    fn fill_buffer(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ApexError::Transport(e)),
            }
        }
    }

    fn pop_frame(&mut self) -> Result<Option<Envelope>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ApexError::Codec(format!("oversized frame: {len} bytes")));
        }
        if self.read_buf.len() < 4 + len {
            return Ok(None);
        }
        let envelope = bincode::deserialize(&self.read_buf[4..4 + len])?;
        self.read_buf.drain(..4 + len);
        Ok(Some(envelope))
    }

}
