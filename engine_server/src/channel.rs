//! Per-client outgoing queue.
//!
//! Messages leave in enqueue order. Reliable messages get a per-client id
//! and stay in flight until the client's cumulative `reliable_ack` covers
//! them; in-flight messages are resent once `resend_interval` has passed.
//! Flushing never waits on the socket: on `WouldBlock` the unsent tail stays
//! queued for the next flush.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use engine_shared::{
    net::ServerMessageType,
    transport::DatagramSocket,
    wire::{self, PacketHeader, WireError, MAX_PACKET_SIZE, PACKET_HEADER_LEN},
};

#[derive(Debug, Clone)]
struct OutgoingMessage {
    message_type: ServerMessageType,
    /// Zero for unreliable messages.
    reliable_id: u32,
    payload: Bytes,
}

impl OutgoingMessage {
    fn wire_len(&self) -> usize {
        wire::frame_len(self.payload.len())
    }

    fn write(&self, packet: &mut BytesMut) -> io::Result<()> {
        wire::write_frame(packet, self.message_type as u8, self.reliable_id, &self.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

#[derive(Debug)]
struct InFlight {
    message: OutgoingMessage,
    first_sent: Instant,
    last_sent: Instant,
}

/// What one flush put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub packets: usize,
    pub messages: usize,
    pub resent: usize,
    /// The socket reported `WouldBlock`; the rest stays queued.
    pub blocked: bool,
}

#[derive(Debug)]
pub struct OutgoingQueue {
    next_sequence: u32,
    next_reliable_id: u32,
    queue: VecDeque<OutgoingMessage>,
    in_flight: VecDeque<InFlight>,
    resend_interval: Duration,
}

impl OutgoingQueue {
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            next_sequence: 1,
            next_reliable_id: 1,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            resend_interval,
        }
    }

    /// Appends a message; returns its reliable id (0 when unreliable).
    ///
    /// A payload too large for a frame is refused before it takes an id, so
    /// the reliable stream the client sees has no gaps.
    pub fn push(
        &mut self,
        message_type: ServerMessageType,
        payload: Bytes,
        reliable: bool,
    ) -> Result<u32, WireError> {
        wire::check_payload_len(payload.len())?;
        let reliable_id = if reliable {
            let id = self.next_reliable_id;
            self.next_reliable_id += 1;
            id
        } else {
            0
        };
        self.queue.push_back(OutgoingMessage {
            message_type,
            reliable_id,
            payload,
        });
        Ok(reliable_id)
    }

    /// Forgets in-flight messages the client has received.
    pub fn acknowledge(&mut self, reliable_ack: u32) {
        while self
            .in_flight
            .front()
            .is_some_and(|f| f.message.reliable_id <= reliable_ack)
        {
            self.in_flight.pop_front();
        }
    }

    /// Messages waiting for their first transmission.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Reliable messages sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// When the oldest unacknowledged reliable message was first sent.
    pub fn oldest_unacknowledged(&self) -> Option<Instant> {
        self.in_flight.front().map(|f| f.first_sent)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Types of the queued (not yet sent) messages, oldest first.
    pub fn queued_types(&self) -> impl Iterator<Item = ServerMessageType> + '_ {
        self.queue.iter().map(|m| m.message_type)
    }

    /// Sends due resends, then queued messages, packed into datagrams.
    pub fn flush(
        &mut self,
        endpoint: SocketAddr,
        socket: &dyn DatagramSocket,
        now: Instant,
    ) -> io::Result<FlushStats> {
        let mut stats = FlushStats::default();

        let due: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, f)| now.saturating_duration_since(f.last_sent) >= self.resend_interval)
            .map(|(i, _)| i)
            .collect();
        let mut due = due.into_iter().peekable();

        while due.peek().is_some() || !self.queue.is_empty() {
            let mut packet = BytesMut::with_capacity(MAX_PACKET_SIZE);
            PacketHeader {
                sequence: self.next_sequence,
                reliable_ack: 0,
            }
            .write(&mut packet);

            let mut resent = Vec::new();
            while let Some(&i) = due.peek() {
                let m = &self.in_flight[i].message;
                if packet.len() > PACKET_HEADER_LEN && packet.len() + m.wire_len() > MAX_PACKET_SIZE {
                    break;
                }
                m.write(&mut packet)?;
                resent.push(i);
                due.next();
            }

            let mut fresh = Vec::new();
            while let Some(m) = self.queue.front() {
                if packet.len() > PACKET_HEADER_LEN && packet.len() + m.wire_len() > MAX_PACKET_SIZE {
                    break;
                }
                if let Err(e) = m.write(&mut packet) {
                    self.requeue(fresh);
                    return Err(e);
                }
                if let Some(m) = self.queue.pop_front() {
                    fresh.push(m);
                }
            }

            match socket.try_send_to(&packet, endpoint) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.requeue(fresh);
                    stats.blocked = true;
                    return Ok(stats);
                }
                Err(e) => {
                    self.requeue(fresh);
                    return Err(e);
                }
            }

            self.next_sequence += 1;
            stats.packets += 1;
            stats.resent += resent.len();
            stats.messages += resent.len() + fresh.len();
            for i in resent {
                self.in_flight[i].last_sent = now;
            }
            for m in fresh {
                if m.reliable_id != 0 {
                    self.in_flight.push_back(InFlight {
                        message: m,
                        first_sent: now,
                        last_sent: now,
                    });
                }
            }
        }
        Ok(stats)
    }

    /// Puts messages taken for an unsent packet back at the front.
    fn requeue(&mut self, fresh: Vec<OutgoingMessage>) {
        for m in fresh.into_iter().rev() {
            self.queue.push_front(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::{
        transport::{MemoryNetwork, MemorySocket},
        wire::{Frames, PacketHeader},
    };
    use std::cell::Cell;

    /// Accepts `budget` datagrams, then fails every send with `then`.
    struct Throttled {
        inner: MemorySocket,
        budget: Cell<usize>,
        then: io::ErrorKind,
    }

    impl Throttled {
        fn new(inner: MemorySocket, budget: usize, then: io::ErrorKind) -> Self {
            Self {
                inner,
                budget: Cell::new(budget),
                then,
            }
        }
    }

    impl DatagramSocket for Throttled {
        fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            match self.budget.get() {
                0 => Err(self.then.into()),
                n => {
                    self.budget.set(n - 1);
                    self.inner.try_send_to(buf, target)
                }
            }
        }

        fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.inner.try_recv_from(buf)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    fn sequences(datagrams: &[(SocketAddr, Vec<u8>)]) -> Vec<u32> {
        datagrams
            .iter()
            .map(|(_, d)| PacketHeader::read(d).unwrap().0.sequence)
            .collect()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn frames(datagrams: &[(SocketAddr, Vec<u8>)]) -> Vec<(u8, u32, Vec<u8>)> {
        datagrams
            .iter()
            .flat_map(|(_, d)| {
                let (_, body) = PacketHeader::read(d).unwrap();
                Frames::new(body)
                    .map(|f| {
                        let f = f.unwrap();
                        (f.tag, f.reliable_id, f.payload.to_vec())
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn flush_preserves_enqueue_order() {
        let net = MemoryNetwork::new();
        let server = net.bind(addr(1)).unwrap();
        let _client = net.bind(addr(2)).unwrap();
        let now = Instant::now();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        q.push(ServerMessageType::Accept, Bytes::from_static(b"a"), true).unwrap();
        q.push(ServerMessageType::Snapshot, Bytes::from_static(b"b"), false).unwrap();
        q.push(ServerMessageType::Disconnect, Bytes::from_static(b"c"), true).unwrap();

        let stats = q.flush(addr(2), &server, now).unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.messages, 3);

        let got = frames(&net.take_pending(addr(2)));
        let payloads: Vec<_> = got.iter().map(|(_, _, p)| p.clone()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(got[0].1, 1);
        assert_eq!(got[1].1, 0);
        assert_eq!(got[2].1, 2);
        assert_eq!(q.in_flight(), 2);
    }

    #[test]
    fn unacknowledged_reliable_messages_are_resent() {
        let net = MemoryNetwork::new();
        let server = net.bind(addr(1)).unwrap();
        let _client = net.bind(addr(2)).unwrap();
        let t0 = Instant::now();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        q.push(ServerMessageType::Accept, Bytes::from_static(b"a"), true).unwrap();
        q.push(ServerMessageType::NewMap, Bytes::from_static(b"b"), true).unwrap();
        q.flush(addr(2), &server, t0).unwrap();
        net.take_pending(addr(2));

        // Not due yet.
        let stats = q.flush(addr(2), &server, t0 + Duration::from_millis(50)).unwrap();
        assert_eq!(stats.packets, 0);

        q.acknowledge(1);
        let stats = q.flush(addr(2), &server, t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(stats.resent, 1);
        let got = frames(&net.take_pending(addr(2)));
        assert_eq!(got, vec![(ServerMessageType::NewMap as u8, 2, b"b".to_vec())]);

        q.acknowledge(2);
        assert!(q.is_idle());
    }

    #[test]
    fn large_queues_are_split_across_packets() {
        let net = MemoryNetwork::new();
        let server = net.bind(addr(1)).unwrap();
        let _client = net.bind(addr(2)).unwrap();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        for _ in 0..10 {
            q.push(ServerMessageType::Snapshot, Bytes::from(vec![7u8; 400]), false).unwrap();
        }
        let stats = q.flush(addr(2), &server, Instant::now()).unwrap();
        assert_eq!(stats.messages, 10);
        assert!(stats.packets >= 3);

        let datagrams = net.take_pending(addr(2));
        assert!(datagrams.iter().all(|(_, d)| d.len() <= MAX_PACKET_SIZE));
        let sequences: Vec<u32> = datagrams
            .iter()
            .map(|(_, d)| PacketHeader::read(d).unwrap().0.sequence)
            .collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn would_block_keeps_the_unsent_tail_in_order() {
        let net = MemoryNetwork::new();
        let socket = Throttled::new(net.bind(addr(1)).unwrap(), 1, io::ErrorKind::WouldBlock);
        let _client = net.bind(addr(2)).unwrap();
        let now = Instant::now();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        for i in 0..10u8 {
            q.push(ServerMessageType::Snapshot, Bytes::from(vec![i; 400]), false).unwrap();
        }
        let stats = q.flush(addr(2), &socket, now).unwrap();
        assert!(stats.blocked);
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.messages, 3);
        assert_eq!(q.queued(), 7);

        socket.budget.set(usize::MAX);
        let stats = q.flush(addr(2), &socket, now).unwrap();
        assert!(!stats.blocked);
        assert_eq!(stats.messages, 7);
        assert_eq!(q.queued(), 0);

        let datagrams = net.take_pending(addr(2));
        assert_eq!(sequences(&datagrams), vec![1, 2, 3, 4]);
        let firsts: Vec<u8> = frames(&datagrams).iter().map(|(_, _, p)| p[0]).collect();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn hard_send_error_requeues_and_reports() {
        let net = MemoryNetwork::new();
        let socket = Throttled::new(net.bind(addr(1)).unwrap(), 0, io::ErrorKind::ConnectionRefused);
        let _client = net.bind(addr(2)).unwrap();
        let now = Instant::now();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        q.push(ServerMessageType::Accept, Bytes::from_static(b"a"), true).unwrap();
        q.push(ServerMessageType::NewMap, Bytes::from_static(b"b"), true).unwrap();
        let err = q.flush(addr(2), &socket, now).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(q.queued(), 2);
        assert_eq!(q.in_flight(), 0);
        assert!(net.take_pending(addr(2)).is_empty());

        socket.budget.set(1);
        q.flush(addr(2), &socket, now).unwrap();
        let got = frames(&net.take_pending(addr(2)));
        let ids: Vec<u32> = got.iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn oversized_payload_is_refused_without_taking_an_id() {
        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        let huge = Bytes::from(vec![0u8; wire::MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            q.push(ServerMessageType::StringListAppend, huge, true),
            Err(WireError::PayloadTooLarge(_))
        ));
        assert_eq!(q.queued(), 0);
        assert_eq!(q.push(ServerMessageType::NewMap, Bytes::from_static(b"m"), true).unwrap(), 1);
    }

    #[test]
    fn oldest_unacknowledged_tracks_the_first_transmission() {
        let net = MemoryNetwork::new();
        let server = net.bind(addr(1)).unwrap();
        let _client = net.bind(addr(2)).unwrap();
        let t0 = Instant::now();

        let mut q = OutgoingQueue::new(Duration::from_millis(100));
        assert_eq!(q.oldest_unacknowledged(), None);
        q.push(ServerMessageType::Accept, Bytes::from_static(b"a"), true).unwrap();
        q.flush(addr(2), &server, t0).unwrap();
        q.push(ServerMessageType::NewMap, Bytes::from_static(b"b"), true).unwrap();
        q.flush(addr(2), &server, t0 + Duration::from_millis(50)).unwrap();

        // Resending does not make a message younger.
        q.flush(addr(2), &server, t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(q.oldest_unacknowledged(), Some(t0));
        q.acknowledge(1);
        assert_eq!(q.oldest_unacknowledged(), Some(t0 + Duration::from_millis(50)));
        q.acknowledge(2);
        assert_eq!(q.oldest_unacknowledged(), None);
    }
}
