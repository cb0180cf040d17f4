//! Transport seam.
//!
//! The monitor core never touches sockets; it talks through `Messenger`.
//! `tcp` provides the real transport for the daemon, `CaptureMessenger`
//! records everything for tests, and the deterministic multi-peer harness in
//! `tests/` wires monitors together with its own in-process implementation.

pub mod tcp;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::messages::Message;
use crate::monmap::Rank;

/// Identifies one client connection for the lifetime of that connection.
pub type ConnId = u64;

pub trait Messenger {
    /// Sends to a monitor peer by rank. Delivery is best-effort; loss is
    /// handled by timeouts above.
    fn send_mon(&self, to: Rank, epoch: u64, msg: Message);

    /// Sends to a client connection.
    fn send_client(&self, con: ConnId, msg: Message);

    /// Probes an address that has no rank in our monmap (a bootstrap hint).
    /// Transports without that ability ignore it.
    fn send_addr(&self, _addr: SocketAddr, _epoch: u64, _msg: Message) {}

    /// A new membership map was installed; transports refresh their link
    /// tables from it.
    fn monmap_updated(&self, _map: &crate::monmap::MonMap) {}

    fn broadcast(&self, to: &[Rank], skip: Rank, epoch: u64, msg: &Message) {
        for r in to {
            if *r != skip {
                self.send_mon(*r, epoch, msg.clone());
            }
        }
    }
}

#[derive(Default)]
pub struct CaptureState {
    pub mons: Vec<(Rank, u64, Message)>,
    pub clients: Vec<(ConnId, Message)>,
    pub addrs: Vec<(SocketAddr, u64, Message)>,
}

impl CaptureState {
    pub fn clear(&mut self) {
        self.mons.clear();
        self.clients.clear();
        self.addrs.clear();
    }
}

/// Records every send instead of delivering it.
pub struct CaptureMessenger {
    state: Rc<RefCell<CaptureState>>,
}

impl CaptureMessenger {
    pub fn new() -> (Rc<RefCell<CaptureState>>, Rc<dyn Messenger>) {
        let state = Rc::new(RefCell::new(CaptureState::default()));
        let net = Rc::new(CaptureMessenger {
            state: state.clone(),
        });
        (state, net)
    }
}

impl Messenger for CaptureMessenger {
    fn send_mon(&self, to: Rank, epoch: u64, msg: Message) {
        self.state.borrow_mut().mons.push((to, epoch, msg));
    }

    fn send_client(&self, con: ConnId, msg: Message) {
        self.state.borrow_mut().clients.push((con, msg));
    }

    fn send_addr(&self, addr: SocketAddr, epoch: u64, msg: Message) {
        self.state.borrow_mut().addrs.push((addr, epoch, msg));
    }
}
