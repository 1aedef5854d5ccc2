//! TCP endpoints
//!
//! Both endpoints use the same framing: a 4-byte big-endian length followed
//! by that many bytes of packet data.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use socket2::SockRef;

use linkgs::{Counters, LinkError, LinkResult, Packet};

use crate::config::constants::MAX_FRAME_SIZE;
use crate::endpoint::{Connectable, LinkCounters, Readable, Writable};

const FRAME_HEADER_SIZE: usize = 4;
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Prefix a buffer with its length
pub fn encode_frame(data: &[u8]) -> LinkResult<Vec<u8>> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(LinkError::runtime(format!(
            "Frame of {} bytes exceeds maximum of {}",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Interface endpoint: opens a TCP connection to the device
pub struct TcpClientLink {
    address: String,
    connect_timeout: Duration,
    /// Only touched by the reading thread and connect()
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    counters: LinkCounters,
}

impl TcpClientLink {
    pub fn new(address: String, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            counters: LinkCounters::new(),
        }
    }

    fn resolve(&self) -> LinkResult<SocketAddr> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| LinkError::runtime(format!("Unable to resolve {}", self.address)))
    }

    fn send(&self, data: &[u8]) -> LinkResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = writer
            .as_mut()
            .ok_or_else(|| LinkError::NotConnected(format!("{} not connected", self.address)))?;
        stream.write_all(data)?;
        stream.flush()?;
        self.counters.record_write(data.len());
        Ok(())
    }
}

impl Connectable for TcpClientLink {
    fn connect(&self) -> LinkResult<()> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        configure_stream(&stream)?;
        let reader = stream.try_clone()?;

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        debug!("Connected to {}", addr);
        Ok(())
    }

    fn disconnect(&self) -> LinkResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Shutting the socket down ends a read blocked on the other handle
        if let Some(stream) = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("Shutdown of {} failed: {}", self.address, e);
            }
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl Readable for TcpClientLink {
    fn read(&self) -> LinkResult<Option<Packet>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = reader.as_mut() else {
            return Ok(None);
        };

        let mut header = [0u8; FRAME_HEADER_SIZE];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                *reader = None;
                return Ok(None);
            }
            Err(_) if !self.connected() => {
                *reader = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(LinkError::runtime(format!(
                "Frame length {} exceeds maximum of {}",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buffer = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut buffer) {
            if !self.connected() {
                *reader = None;
                return Ok(None);
            }
            return Err(e.into());
        }

        self.counters.record_read(FRAME_HEADER_SIZE + len);
        Ok(Some(Packet::new(buffer)))
    }
}

impl Writable for TcpClientLink {
    fn write(&self, packet: &Packet) -> LinkResult<()> {
        let frame = encode_frame(&packet.buffer)?;
        self.send(&frame)
    }

    fn write_raw(&self, data: &[u8]) -> LinkResult<()> {
        self.send(data)
    }
}

/// Router endpoint: listens for downstream clients and broadcasts every
/// packet to all of them. Never reads.
pub struct TcpServerLink {
    address: String,
    listener: Mutex<Option<TcpListener>>,
    clients: Mutex<Vec<(SocketAddr, TcpStream)>>,
    counters: LinkCounters,
}

impl TcpServerLink {
    pub fn new(address: String) -> Self {
        Self {
            address,
            listener: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            counters: LinkCounters::new(),
        }
    }

    /// Address actually bound, useful when listening on port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    fn accept_pending(&self, clients: &mut Vec<(SocketAddr, TcpStream)>) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(listener) = listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let setup = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT)))
                        .and_then(|_| configure_stream(&stream));
                    match setup {
                        Ok(()) => {
                            info!("Router client connected from {}", addr);
                            clients.push((addr, stream));
                        }
                        Err(e) => warn!("Rejecting client {}: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Accept on {} failed: {}", self.address, e);
                    break;
                }
            }
        }
    }

    fn broadcast(&self, data: &[u8]) -> LinkResult<()> {
        if !self.connected() {
            return Err(LinkError::NotConnected(format!("{} not listening", self.address)));
        }

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        self.accept_pending(&mut clients);

        clients.retain_mut(|(addr, stream)| match stream.write_all(data) {
            Ok(()) => true,
            Err(e) => {
                info!("Router client {} dropped: {}", addr, e);
                false
            }
        });

        self.counters.set_num_clients(clients.len());
        self.counters.record_write(data.len());
        Ok(())
    }
}

impl Connectable for TcpServerLink {
    fn connect(&self) -> LinkResult<()> {
        let listener = TcpListener::bind(&self.address)?;
        listener.set_nonblocking(true)?;
        debug!("Listening on {:?}", listener.local_addr());
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    fn disconnect(&self) -> LinkResult<()> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, stream) in clients.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.counters.set_num_clients(0);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl Readable for TcpServerLink {
    fn read_allowed(&self) -> LinkResult<bool> {
        Ok(false)
    }

    fn read(&self) -> LinkResult<Option<Packet>> {
        Err(LinkError::runtime("Router links are write only"))
    }
}

impl Writable for TcpServerLink {
    fn write(&self, packet: &Packet) -> LinkResult<()> {
        let frame = encode_frame(&packet.buffer)?;
        self.broadcast(&frame)
    }

    fn write_raw(&self, data: &[u8]) -> LinkResult<()> {
        self.broadcast(data)
    }
}
