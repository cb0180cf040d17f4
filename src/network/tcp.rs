//! TCP transport.
//!
//! One listener thread accepts connections and spawns a reader per
//! connection; each outbound peer link gets a writer thread fed by a channel,
//! which (re)connects lazily with backoff. Every decoded frame is pushed into
//! the monitor's event channel; the monitor thread stays the only place where
//! protocol state is touched.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::channel;
use tracing::{debug, trace, warn};

use super::{ConnId, Messenger};
use crate::messages::{self, Envelope, Message};
use crate::monmap::{Rank, RANK_NONE};

const CONNECT_RETRY_MS: u64 = 500;
const READ_BUF: usize = 64 * 1024;

/// Events surfaced to the monitor's event loop.
#[derive(Debug)]
pub enum NetEvent {
    Peer(Envelope),
    Client { con: ConnId, msg: Message },
    ClientReset { con: ConnId },
}

struct Links {
    peers: HashMap<Rank, channel::Sender<Bytes>>,
    clients: HashMap<ConnId, channel::Sender<Bytes>>,
    peer_addrs: HashMap<Rank, SocketAddr>,
}

pub struct TcpNet {
    my_rank: Rank,
    links: Mutex<Links>,
    events: channel::Sender<NetEvent>,
    next_con: AtomicU64,
}

impl TcpNet {
    /// Binds `addr` and starts the accept loop. `peer_addrs` seeds the
    /// outbound link table; it is refreshed on monmap changes.
    pub fn spawn(
        addr: SocketAddr,
        my_rank: Rank,
        peer_addrs: HashMap<Rank, SocketAddr>,
        events: channel::Sender<NetEvent>,
    ) -> std::io::Result<Arc<TcpNet>> {
        let listener = TcpListener::bind(addr)?;
        let net = Arc::new(TcpNet {
            my_rank,
            links: Mutex::new(Links {
                peers: HashMap::new(),
                clients: HashMap::new(),
                peer_addrs,
            }),
            events,
            next_con: AtomicU64::new(1),
        });

        let accept_net = net.clone();
        thread::Builder::new()
            .name("mon-accept".into())
            .spawn(move || accept_loop(listener, accept_net))?;
        Ok(net)
    }

    pub fn update_peer_addrs(&self, peer_addrs: HashMap<Rank, SocketAddr>) {
        let mut links = self.links.lock().unwrap();
        links.peer_addrs = peer_addrs;
        // Writers for dropped or moved peers die on their next send attempt.
        links.peers.clear();
    }

    fn peer_sender(&self, rank: Rank) -> Option<channel::Sender<Bytes>> {
        let mut links = self.links.lock().unwrap();
        if let Some(tx) = links.peers.get(&rank) {
            return Some(tx.clone());
        }
        let addr = *links.peer_addrs.get(&rank)?;
        let (tx, rx) = channel::unbounded::<Bytes>();
        links.peers.insert(rank, tx.clone());
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("mon-peer-{rank}"))
            .spawn(move || peer_writer_loop(addr, rx, events));
        if spawned.is_err() {
            links.peers.remove(&rank);
            return None;
        }
        Some(tx)
    }

    fn drop_client(&self, con: ConnId) {
        self.links.lock().unwrap().clients.remove(&con);
        let _ = self.events.send(NetEvent::ClientReset { con });
    }
}

fn accept_loop(listener: TcpListener, net: Arc<TcpNet>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let con = net.next_con.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded::<Bytes>();
        net.links.lock().unwrap().clients.insert(con, tx);

        let write_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "clone of accepted stream failed");
                net.links.lock().unwrap().clients.remove(&con);
                continue;
            }
        };
        let _ = thread::Builder::new()
            .name(format!("mon-conn-{con}"))
            .spawn(move || writer_loop(write_half, rx));

        let reader_net = net.clone();
        let _ = thread::Builder::new()
            .name(format!("mon-read-{con}"))
            .spawn(move || reader_loop(stream, con, reader_net));
    }
}

/// Reads frames off one accepted connection. Frames stamped with a monitor
/// rank go to the peer path; everything else is client traffic tied to this
/// connection.
fn reader_loop(mut stream: TcpStream, con: ConnId, net: Arc<TcpNet>) {
    let mut buf = BytesMut::with_capacity(READ_BUF);
    let mut chunk = [0u8; READ_BUF];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        loop {
            match messages::decode_frame(&mut buf) {
                Ok(Some(env)) => {
                    trace!(from = env.from, tag = env.msg.type_tag(), "frame in");
                    let event = if env.from == RANK_NONE {
                        NetEvent::Client {
                            con,
                            msg: env.msg,
                        }
                    } else {
                        NetEvent::Peer(env)
                    };
                    if net.events.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(con, "dropping connection after undecodable frame");
                    net.drop_client(con);
                    return;
                }
            }
        }
    }
    net.drop_client(con);
}

fn writer_loop(mut stream: TcpStream, rx: channel::Receiver<Bytes>) {
    while let Ok(frame) = rx.recv() {
        if stream.write_all(&frame).is_err() {
            break;
        }
    }
}

/// Outbound link to a peer: connect (with retry), then drain the queue. The
/// read side of the same socket feeds replies back into the event channel.
fn peer_writer_loop(
    addr: SocketAddr,
    rx: channel::Receiver<Bytes>,
    events: channel::Sender<NetEvent>,
) {
    let Ok(first) = rx.recv() else { return };
    let mut pending = Some(first);
    loop {
        let stream = match TcpStream::connect(addr) {
            Ok(s) => {
                let _ = s.set_nodelay(true);
                s
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, "peer connect failed; retrying");
                thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
                // Stale traffic is useless once the peer comes back; keep
                // only the newest frame while disconnected.
                while let Ok(frame) = rx.try_recv() {
                    pending = Some(frame);
                }
                continue;
            }
        };

        if let Ok(read_half) = stream.try_clone() {
            let ev = events.clone();
            let _ = thread::Builder::new()
                .name("mon-peer-read".into())
                .spawn(move || peer_reader_loop(read_half, ev));
        }

        let mut stream = stream;
        if let Some(frame) = pending.take() {
            if stream.write_all(&frame).is_err() {
                pending = None;
                continue;
            }
        }
        loop {
            match rx.recv() {
                Ok(frame) => {
                    if stream.write_all(&frame).is_err() {
                        break;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

fn peer_reader_loop(mut stream: TcpStream, events: channel::Sender<NetEvent>) {
    let mut buf = BytesMut::with_capacity(READ_BUF);
    let mut chunk = [0u8; READ_BUF];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        loop {
            match messages::decode_frame(&mut buf) {
                Ok(Some(env)) if env.from != RANK_NONE => {
                    if events.send(NetEvent::Peer(env)).is_err() {
                        return;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

/// Monitor-thread handle implementing the `Messenger` seam over a `TcpNet`.
pub struct TcpMessenger {
    net: Arc<TcpNet>,
}

impl TcpMessenger {
    pub fn new(net: Arc<TcpNet>) -> TcpMessenger {
        TcpMessenger { net }
    }
}

impl Messenger for TcpMessenger {
    fn send_mon(&self, to: Rank, epoch: u64, msg: Message) {
        let frame = messages::encode_frame(&Envelope {
            from: self.net.my_rank,
            epoch,
            msg,
        });
        match self.net.peer_sender(to) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(to, "no address for peer; dropping frame"),
        }
    }

    fn send_client(&self, con: ConnId, msg: Message) {
        let frame = messages::encode_frame(&Envelope {
            from: self.net.my_rank,
            epoch: 0,
            msg,
        });
        let tx = self.net.links.lock().unwrap().clients.get(&con).cloned();
        match tx {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(con, "client connection gone; dropping reply"),
        }
    }

    fn monmap_updated(&self, map: &crate::monmap::MonMap) {
        let addrs = map
            .peers()
            .iter()
            .map(|p| (p.rank, p.addr))
            .collect::<HashMap<_, _>>();
        self.net.update_peer_addrs(addrs);
    }

    fn send_addr(&self, addr: SocketAddr, epoch: u64, msg: Message) {
        // One-shot probe to a hinted address outside the monmap.
        let frame = messages::encode_frame(&Envelope {
            from: self.net.my_rank,
            epoch,
            msg,
        });
        let events = self.net.events.clone();
        let _ = thread::Builder::new().name("mon-hint".into()).spawn(move || {
            if let Ok(mut stream) = TcpStream::connect_timeout(&addr, Duration::from_secs(2)) {
                if stream.write_all(&frame).is_ok() {
                    peer_reader_loop(stream, events);
                }
            }
        });
    }
}
