//! Node liveness table.
//!
//! One [`NodeRecord`] per known device tracks whether it can receive radio
//! traffic right now and holds the messages parked while it sleeps.
//! Always-listening and frequently-listening (FLiRS) devices are never
//! redirected; only battery devices that are currently asleep are.

use zwave_frame::Message;

/// Liveness and wake-up state for one device.
#[derive(Debug)]
pub struct NodeRecord {
    /// Node id on the network.
    pub node_id: u8,
    /// Mains-powered, always able to receive.
    pub is_listening: bool,
    /// Wakes on beam; treated as reachable even while "asleep".
    pub is_frequently_listening: bool,
    /// Whether the device is currently in its wake window. Only meaningful
    /// for non-listening devices; they are assumed awake until a send
    /// times out or they announce sleep.
    pub is_awake: bool,
    /// A poll came due while the device slept; issue it at next wake.
    pub poll_on_wake: bool,
    /// Secure communication has persistently failed for this device.
    pub secure_degraded: bool,
    /// Command classes the device only accepts encapsulated.
    pub secured_classes: Vec<u8>,
    /// Messages parked until the device wakes, in enqueue order.
    pending_wakeup: Vec<Message>,
}

impl NodeRecord {
    /// Create a record for a device.
    pub fn new(node_id: u8, is_listening: bool, is_frequently_listening: bool) -> Self {
        NodeRecord {
            node_id,
            is_listening,
            is_frequently_listening,
            is_awake: true,
            poll_on_wake: false,
            secure_degraded: false,
            secured_classes: Vec::new(),
            pending_wakeup: Vec::new(),
        }
    }

    /// Whether sends should be rerouted to the wake-up queue right now.
    pub fn should_redirect(&self) -> bool {
        !self.is_listening && !self.is_frequently_listening && !self.is_awake
    }

    /// Park a message until the device wakes.
    pub fn queue_pending(&mut self, msg: Message) {
        log::info!("node {} asleep - parking message: {}", self.node_id, msg.description());
        self.pending_wakeup.push(msg);
    }

    /// Take the parked messages, preserving enqueue order.
    pub fn take_pending(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending_wakeup)
    }

    /// Number of parked messages.
    pub fn pending_len(&self) -> usize {
        self.pending_wakeup.len()
    }
}

/// All known devices, keyed by node id.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: std::collections::HashMap<u8, NodeRecord>,
}

impl NodeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, replacing any previous record.
    pub fn add(&mut self, node_id: u8, is_listening: bool, is_frequently_listening: bool) {
        self.nodes.insert(
            node_id,
            NodeRecord::new(node_id, is_listening, is_frequently_listening),
        );
    }

    /// Look up a device.
    pub fn get(&self, node_id: u8) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    /// Look up a device mutably.
    pub fn get_mut(&mut self, node_id: u8) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(&node_id)
    }

    /// Whether sends to this device should be rerouted right now. Unknown
    /// devices are assumed reachable.
    pub fn should_redirect(&self, node_id: u8) -> bool {
        self.get(node_id).map_or(false, NodeRecord::should_redirect)
    }

    /// Whether this device sleeps (and so owns a wake-up queue).
    pub fn is_sleeper(&self, node_id: u8) -> bool {
        self.get(node_id)
            .map_or(false, |n| !n.is_listening && !n.is_frequently_listening)
    }
}
