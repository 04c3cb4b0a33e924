//! Cluster group messaging.
//!
//! The daemon pair coordinates through a best-effort totally-ordered
//! broadcast: 4-byte big-endian message codes, delivered to every member in
//! the same order, plus membership (join/leave) events. The transport itself
//! is an external collaborator; `ClusterGroup` is the in-process stand-in
//! that the daemon and the smoke tests share. Delivery callbacks run
//! synchronously and must not suspend.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::{ColodError, Result};

/// Longest permitted group name, matching the usual cluster-stack limit.
pub const MAX_GROUP_NAME: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMessage {
    Failover,
    Failed,
    Hello,
    Yellow,
    Unyellow,
    ShutdownRequest,
    Shutdown,
    ShutdownDone,
    Reboot,
    RebootRestart,
}

impl ClusterMessage {
    pub fn to_wire(self) -> [u8; 4] {
        let code: u32 = match self {
            ClusterMessage::Failover => 1,
            ClusterMessage::Failed => 2,
            ClusterMessage::Hello => 3,
            ClusterMessage::Yellow => 4,
            ClusterMessage::Unyellow => 5,
            ClusterMessage::ShutdownRequest => 6,
            ClusterMessage::Shutdown => 7,
            ClusterMessage::ShutdownDone => 8,
            ClusterMessage::Reboot => 9,
            ClusterMessage::RebootRestart => 10,
        };
        code.to_be_bytes()
    }

    /// Decode a wire payload. Payloads of the wrong length are dropped with a
    /// log entry; unknown codes are silently ignored.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = match payload.try_into() {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!("Got message of invalid length {}", payload.len());
                return None;
            }
        };

        match u32::from_be_bytes(bytes) {
            1 => Some(ClusterMessage::Failover),
            2 => Some(ClusterMessage::Failed),
            3 => Some(ClusterMessage::Hello),
            4 => Some(ClusterMessage::Yellow),
            5 => Some(ClusterMessage::Unyellow),
            6 => Some(ClusterMessage::ShutdownRequest),
            7 => Some(ClusterMessage::Shutdown),
            8 => Some(ClusterMessage::ShutdownDone),
            9 => Some(ClusterMessage::Reboot),
            10 => Some(ClusterMessage::RebootRestart),
            _ => None,
        }
    }
}

/// Delivery callback: `(message, from_self, peer_left)`. A membership change
/// where a peer left the group is reported as `(None, false, true)`.
pub type ClusterCallback = Rc<dyn Fn(Option<ClusterMessage>, bool, bool)>;

struct Endpoint {
    node_id: u32,
    callbacks: RefCell<Vec<(u64, ClusterCallback)>>,
    next_callback_id: Cell<u64>,
}

impl Endpoint {
    fn deliver(&self, sender: u32, payload: &[u8]) {
        let Some(message) = ClusterMessage::decode(payload) else {
            return;
        };
        let from_self = sender == self.node_id;
        // snapshot: a callback may (de)register callbacks
        let callbacks = self.callbacks.borrow().clone();
        for (_, callback) in callbacks {
            callback(Some(message), from_self, false);
        }
    }

    fn member_left(&self) {
        let callbacks = self.callbacks.borrow().clone();
        for (_, callback) in callbacks {
            callback(None, false, true);
        }
    }
}

/// An in-process broadcast group. Multicast delivers to every joined member
/// synchronously and in a single global order.
pub struct ClusterGroup {
    name: String,
    members: RefCell<Vec<Weak<Endpoint>>>,
    next_node_id: Cell<u32>,
}

impl ClusterGroup {
    pub fn new(name: &str) -> Result<Rc<Self>> {
        if name.is_empty() || !name.is_ascii() {
            return Err(ColodError::Fatal("Invalid instance name".to_string()));
        }
        if name.len() >= MAX_GROUP_NAME {
            return Err(ColodError::Fatal("Instance name too long".to_string()));
        }

        Ok(Rc::new(Self {
            name: name.to_string(),
            members: RefCell::new(Vec::new()),
            next_node_id: Cell::new(1),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(self: &Rc<Self>) -> Cluster {
        let node_id = self.next_node_id.get();
        self.next_node_id.set(node_id + 1);

        let endpoint = Rc::new(Endpoint {
            node_id,
            callbacks: RefCell::new(Vec::new()),
            next_callback_id: Cell::new(0),
        });
        self.members.borrow_mut().push(Rc::downgrade(&endpoint));

        Cluster {
            group: self.clone(),
            endpoint,
        }
    }

    fn multicast(&self, sender: u32, payload: &[u8]) {
        let members: Vec<Rc<Endpoint>> = self
            .members
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for member in members {
            member.deliver(sender, payload);
        }
    }

    fn leave(&self, node_id: u32) {
        let remaining: Vec<Rc<Endpoint>> = {
            let mut members = self.members.borrow_mut();
            members.retain(|member| {
                member
                    .upgrade()
                    .map(|endpoint| endpoint.node_id != node_id)
                    .unwrap_or(false)
            });
            members.iter().filter_map(Weak::upgrade).collect()
        };
        for member in remaining {
            member.member_left();
        }
    }
}

/// One member's handle on the group.
#[derive(Clone)]
pub struct Cluster {
    group: Rc<ClusterGroup>,
    endpoint: Rc<Endpoint>,
}

impl Cluster {
    pub fn send(&self, message: ClusterMessage) {
        self.group
            .multicast(self.endpoint.node_id, &message.to_wire());
    }

    pub fn add_notify(&self, callback: impl Fn(Option<ClusterMessage>, bool, bool) + 'static) -> u64 {
        let id = self.endpoint.next_callback_id.get();
        self.endpoint.next_callback_id.set(id + 1);
        self.endpoint
            .callbacks
            .borrow_mut()
            .push((id, Rc::new(callback)));
        id
    }

    pub fn del_notify(&self, id: u64) {
        self.endpoint
            .callbacks
            .borrow_mut()
            .retain(|(callback_id, _)| *callback_id != id);
    }

    /// Leave the group, delivering a membership change to the remaining
    /// members.
    pub fn leave(&self) {
        self.group.leave(self.endpoint.node_id);
    }
}
