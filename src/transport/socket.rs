//! Point-to-point and broadcast sockets built on framed TCP.
//!
//! - [`PullSocket`] / [`PushSocket`]: many-to-one queues (workers to the
//!   replay server, actors to the coordinator).
//! - [`PubSocket`] / [`SubSocket`]: one-to-many broadcast (parameters and
//!   data requests to workers).
//!
//! All receive paths are non-blocking polls; only bootstrap waits block,
//! and those are bounded by the caller's deadline. Delivery is
//! at-most-once: a send to a dead peer is message loss, which the
//! pipeline tolerates by design (frequent resampling, periodic
//! re-broadcast).

use crate::endpoints::allocate_port;
use crate::error::{ApexError, Result};
use crate::messages::Envelope;
use crate::transport::frame::FramedStream;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// Interval between polls while blocking on a bootstrap receive.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn accept_pending(listener: &TcpListener, conns: &mut Vec<FramedStream>) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => conns.push(FramedStream::new(stream, true)?),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(ApexError::Transport(e)),
        }
    }
}

/// Receiving end of a many-to-one channel.
///
/// Accepts any number of senders; messages from a single sender arrive in
/// order, no ordering holds across senders.
pub struct PullSocket {
    listener: TcpListener,
    conns: Vec<FramedStream>,
    next_conn: usize,
}

impl PullSocket {
    /// Bind to a free port in the window. Returns the socket and its port.
    pub fn bind(min_port: u16, range: u16) -> Result<(Self, u16)> {
        let (listener, port) = allocate_port(min_port, range)?;
        listener.set_nonblocking(true)?;
        Ok((
            Self {
                listener,
                conns: Vec::new(),
                next_conn: 0,
            },
            port,
        ))
    }

    /// Non-blocking poll for the next message from any connected sender.
    ///
    /// Dead connections are discarded silently; their unsent messages are
    /// lost, which the at-most-once model tolerates.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>> {
        accept_pending(&self.listener, &mut self.conns)?;
        if self.conns.is_empty() {
            return Ok(None);
        }

        // Round-robin so one chatty sender cannot starve the rest.
        let n = self.conns.len();
        for offset in 0..n {
            let idx = (self.next_conn + offset) % n;
            match self.conns[idx].try_recv() {
                Ok(Some(envelope)) => {
                    self.next_conn = (idx + 1) % n;
                    return Ok(Some(envelope));
                }
                Ok(None) => continue,
                Err(_) => {
                    self.conns.remove(idx);
                    return self.try_recv();
                }
            }
        }
        Ok(None)
    }

    /// Blocking receive with a deadline, used only during bootstrap.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.try_recv()? {
                return Ok(Some(envelope));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Number of currently connected senders.
    pub fn sender_count(&self) -> usize {
        self.conns.len()
    }
}

/// Sending end of a many-to-one channel.
pub struct PushSocket {
    conn: FramedStream,
}

impl PushSocket {
    /// Connect to a pull endpoint.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            conn: FramedStream::new(stream, false)?,
        })
    }

    /// Connect, retrying until the deadline (the peer may still be binding
    /// its socket during bootstrap).
    pub fn connect_retry(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(addr) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Send one message. An error means the message is lost; callers treat
    /// this as tolerable loss or propagate, depending on the channel.
    pub fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.conn.send(envelope)
    }
}

/// Broadcasting end of a one-to-many channel.
pub struct PubSocket {
    listener: TcpListener,
    subscribers: Vec<FramedStream>,
}

impl PubSocket {
    /// Bind to a free port in the window. Returns the socket and its port.
    pub fn bind(min_port: u16, range: u16) -> Result<(Self, u16)> {
        let (listener, port) = allocate_port(min_port, range)?;
        listener.set_nonblocking(true)?;
        Ok((
            Self {
                listener,
                subscribers: Vec::new(),
            },
            port,
        ))
    }

    /// Broadcast to every connected subscriber. Subscribers whose
    /// connection has died are dropped; they will re-subscribe on restart.
    pub fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        accept_pending(&self.listener, &mut self.subscribers)?;
        self.subscribers
            .retain_mut(|sub| sub.send(envelope).is_ok());
        Ok(())
    }

    /// Accept any pending subscriptions without publishing.
    pub fn poll_subscribers(&mut self) -> Result<usize> {
        accept_pending(&self.listener, &mut self.subscribers)?;
        Ok(self.subscribers.len())
    }
}

/// Subscribing end of a one-to-many channel.
pub struct SubSocket {
    conn: FramedStream,
}

impl SubSocket {
    /// Connect to a pub endpoint.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            conn: FramedStream::new(stream, true)?,
        })
    }

    /// Connect, retrying until the deadline.
    pub fn connect_retry(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(addr) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Non-blocking poll for the next broadcast message.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>> {
        self.conn.try_recv()
    }

    /// Drain everything pending and return only the newest message.
    ///
    /// Workers only ever need the latest parameter snapshot; intermediate
    /// versions are superseded before they would be applied.
    pub fn latest(&mut self) -> Result<Option<Envelope>> {
        let mut newest = None;
        while let Some(envelope) = self.try_recv()? {
            newest = Some(envelope);
        }
        Ok(newest)
    }
}
