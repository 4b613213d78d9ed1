//! Datagram transport.
//!
//! The replication layer only needs non-blocking send/receive of whole
//! datagrams. [`DatagramSocket`] is implemented for `tokio::net::UdpSocket`
//! and for [`MemorySocket`], an in-process network used by tests and tools
//! that want deterministic delivery.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::net::UdpSocket;

/// Non-blocking datagram socket.
///
/// Both calls return `io::ErrorKind::WouldBlock` instead of waiting.
pub trait DatagramSocket: Send {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::try_recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

type Inbox = VecDeque<(SocketAddr, Vec<u8>)>;

/// In-process datagram network.
///
/// Datagrams to an address nobody is bound to are silently lost, as with UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<SocketAddr, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a socket at `addr`. Fails if the address is taken.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut inboxes = self.lock()?;
        if inboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        inboxes.insert(addr, Inbox::new());
        Ok(MemorySocket {
            addr,
            net: self.clone(),
        })
    }

    /// Number of datagrams waiting for `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock()
            .map(|i| i.get(&addr).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Drains every datagram waiting for `addr`, oldest first, without a socket.
    pub fn take_pending(&self, addr: SocketAddr) -> Vec<(SocketAddr, Vec<u8>)> {
        self.lock()
            .ok()
            .and_then(|mut i| i.get_mut(&addr).map(|q| q.drain(..).collect()))
            .unwrap_or_default()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<SocketAddr, Inbox>>> {
        self.inboxes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory network lock poisoned"))
    }
}

/// Socket bound on a [`MemoryNetwork`]. Unbinds on drop.
pub struct MemorySocket {
    addr: SocketAddr,
    net: MemoryNetwork,
}

impl DatagramSocket for MemorySocket {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut inboxes = self.net.lock()?;
        if let Some(inbox) = inboxes.get_mut(&target) {
            inbox.push_back((self.addr, buf.to_vec()));
        }
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inboxes = self.net.lock()?;
        let inbox = inboxes
            .get_mut(&self.addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket unbound"))?;
        match inbox.pop_front() {
            Some((from, data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        if let Ok(mut inboxes) = self.net.lock() {
            inboxes.remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn memory_sockets_exchange_datagrams_in_order() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr(1)).unwrap();
        let b = net.bind(addr(2)).unwrap();

        a.try_send_to(b"one", addr(2)).unwrap();
        a.try_send_to(b"two", addr(2)).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.try_recv_from(&mut buf).unwrap();
        assert_eq!((&buf[..n], from), (&b"one"[..], addr(1)));
        let (n, _) = b.try_recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(
            b.try_recv_from(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn datagrams_to_unbound_addresses_are_lost() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr(1)).unwrap();
        {
            let _b = net.bind(addr(2)).unwrap();
        }
        assert_eq!(a.try_send_to(b"lost", addr(2)).unwrap(), 4);
        assert_eq!(net.pending(addr(2)), 0);
        assert!(net.bind(addr(2)).is_ok());
    }
}
