//! The driver: three threads around the shared engine state.
//!
//! ## Architecture
//!
//! - **reader**: blocks on the serial port, feeds the frame codec, answers
//!   frames with ACK/NAK, and routes decoded payloads to the transaction
//!   engine, the security layer, and the command dispatcher.
//! - **sender**: blocks on "queue has work and nothing in flight", performs
//!   exactly one wire write per wake, and re-arms the retry window.
//! - **poller**: walks the poll rotation, spacing state requests evenly
//!   across the configured interval.
//!
//! The three threads share the send queue (inside the transaction engine),
//! the node liveness table, and the security session table, each behind its
//! own lock. The serial port has its own lock; the reader holds it for the
//! duration of one frame so a write can never interleave with a partially
//! received frame. Lock order is always engine state before transport;
//! the reader never acquires engine state while holding the port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use zwave_frame::{
    ControlByte, FrameCodec, LinkInput, Message, ACK, COMMAND_CLASS_SECURITY,
    COMMAND_CLASS_WAKE_UP, FUNC_ID_APPLICATION_COMMAND_HANDLER, FUNC_ID_ZW_SEND_DATA,
    MAX_FRAME_SIZE, NAK, REQUEST, RESPONSE, SECURITY_CMD_MESSAGE_ENCAP,
    SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET, SECURITY_CMD_NETWORK_KEY_VERIFY,
    SECURITY_CMD_NONCE_GET, SECURITY_CMD_NONCE_REPORT, SECURITY_CMD_SCHEME_REPORT,
    SECURITY_CMD_SUPPORTED_REPORT, TRANSMIT_COMPLETE_OK, WAKE_UP_CMD_NOTIFICATION,
};
use zwave_security::{
    Bootstrap, BootstrapAction, NetworkKey, NonceOutcome, SecurityError, SecuritySession,
};

use crate::{
    CommandDispatcher, DriverConfig, DriverError, DriverStatistics, NodeTable, PollList,
    SerialTransport, StatsSnapshot, TransactionEngine, TransactionPhase,
};

/// State shared by the reader, sender, and poller threads.
struct Shared {
    config: DriverConfig,
    engine: TransactionEngine,
    transport: Mutex<Box<dyn SerialTransport + Send>>,
    nodes: Mutex<NodeTable>,
    sessions: Mutex<HashMap<u8, SecuritySession>>,
    bootstraps: Mutex<HashMap<u8, Bootstrap>>,
    network_key: Mutex<Option<NetworkKey>>,
    poll: Mutex<PollList>,
    dispatcher: Arc<dyn CommandDispatcher>,
    stats: Arc<DriverStatistics>,
    shutdown: AtomicBool,
    shutdown_rx: Receiver<()>,
}

/// The host-side driver for one controller.
pub struct Driver {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    started: bool,
}

impl Driver {
    /// Create a driver over the given transport and dispatcher. Threads do
    /// not run until [`start`](Driver::start).
    pub fn new(
        transport: Box<dyn SerialTransport + Send>,
        dispatcher: Arc<dyn CommandDispatcher>,
        config: DriverConfig,
    ) -> Self {
        let stats = Arc::new(DriverStatistics::default());
        let engine = TransactionEngine::new(
            stats.clone(),
            config.transaction_timeout(),
            config.max_send_attempts,
        );
        let (shutdown_tx, shutdown_rx) = bounded(1);

        Driver {
            shared: Arc::new(Shared {
                config,
                engine,
                transport: Mutex::new(transport),
                nodes: Mutex::new(NodeTable::new()),
                sessions: Mutex::new(HashMap::new()),
                bootstraps: Mutex::new(HashMap::new()),
                network_key: Mutex::new(None),
                poll: Mutex::new(PollList::new()),
                dispatcher,
                stats,
                shutdown: AtomicBool::new(false),
                shutdown_rx,
            }),
            threads: Vec::new(),
            shutdown_tx: Some(shutdown_tx),
            started: false,
        }
    }

    /// Spawn the reader, sender, and poller threads.
    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.started {
            return Err(DriverError::AlreadyStarted);
        }
        self.started = true;

        let reader = self.shared.clone();
        self.threads.push(thread::spawn(move || run_reader(reader)));
        let sender = self.shared.clone();
        self.threads.push(thread::spawn(move || run_sender(sender)));
        let poller = self.shared.clone();
        self.threads.push(thread::spawn(move || run_poller(poller)));
        Ok(())
    }

    /// Signal the threads to stop and wait for them.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_tx = None; // disconnects every cancellable sleep
        self.shared.engine.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.started = false;
    }

    /// Register a device.
    pub fn add_node(&self, node_id: u8, is_listening: bool, is_frequently_listening: bool) {
        self.shared
            .nodes
            .lock()
            .add(node_id, is_listening, is_frequently_listening);
    }

    /// Set the network key used for secure sessions and inclusion.
    pub fn set_network_key(&self, key: NetworkKey) {
        *self.shared.network_key.lock() = Some(key);
    }

    /// Create a security session for a device, keyed with the network key.
    pub fn add_secure_node(&self, node_id: u8) -> Result<(), DriverError> {
        let key = match *self.shared.network_key.lock() {
            Some(key) => key,
            None => return Err(DriverError::NoNetworkKey),
        };
        let session = SecuritySession::new(&key).with_limits(
            self.shared.config.nonce_timeout(),
            self.shared.config.nonce_retry_cap,
        );
        self.shared.sessions.lock().insert(node_id, session);
        Ok(())
    }

    /// Start the secure-inclusion handshake with a freshly added device.
    pub fn begin_secure_inclusion(&self, node_id: u8) -> Result<(), DriverError> {
        if self.shared.network_key.lock().is_none() {
            return Err(DriverError::NoNetworkKey);
        }
        let action = self
            .shared
            .bootstraps
            .lock()
            .entry(node_id)
            .or_default()
            .begin();
        self.shared.apply_bootstrap_action(node_id, action);
        Ok(())
    }

    /// Queue an outbound message. Messages marked secure are routed through
    /// the encapsulation layer; messages for sleeping devices are parked on
    /// their wake-up queue.
    pub fn send_message(&self, msg: Message) -> Result<(), DriverError> {
        if msg.secure() {
            let node_id = msg.target_node_id();
            let payload = msg
                .application_payload()
                .ok_or(DriverError::NotEncapsulatable)?
                .to_vec();
            return self.shared.queue_secure(node_id, &payload);
        }
        self.shared.enqueue_message(msg);
        Ok(())
    }

    /// Enroll a device in the poll rotation.
    pub fn poll_enable(&self, node_id: u8, intensity: u8) {
        self.shared.poll.lock().enable(node_id, intensity);
    }

    /// Remove a device from the poll rotation.
    pub fn poll_disable(&self, node_id: u8) -> bool {
        self.shared.poll.lock().disable(node_id)
    }

    /// Tell the driver a sleeping device is awake (wake-up notifications
    /// received over the radio do this automatically).
    pub fn notify_node_awake(&self, node_id: u8) {
        self.shared.handle_wakeup_notification(node_id);
    }

    /// Snapshot of the driver counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of queued (not in-flight) messages.
    pub fn queue_len(&self) -> usize {
        self.shared.engine.queue_len()
    }

    /// Current transaction phase.
    pub fn transaction_phase(&self) -> TransactionPhase {
        self.shared.engine.phase()
    }

    /// Number of messages parked on a device's wake-up queue.
    pub fn pending_wakeup_len(&self, node_id: u8) -> usize {
        self.shared
            .nodes
            .lock()
            .get(node_id)
            .map_or(0, |n| n.pending_len())
    }

    /// Whether a device is currently marked awake.
    pub fn is_node_awake(&self, node_id: u8) -> bool {
        self.shared.nodes.lock().get(node_id).map_or(true, |n| n.is_awake)
    }

    /// Whether a poll is owed to a device at its next wake.
    pub fn poll_owed(&self, node_id: u8) -> bool {
        self.shared
            .nodes
            .lock()
            .get(node_id)
            .map_or(false, |n| n.poll_on_wake)
    }

    /// Whether secure communication with a device has persistently failed.
    pub fn node_secure_degraded(&self, node_id: u8) -> bool {
        self.shared
            .nodes
            .lock()
            .get(node_id)
            .map_or(false, |n| n.secure_degraded)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Signal without joining; threads exit on their own.
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_tx = None;
        self.shared.engine.notify_all();
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

impl Shared {
    /// Sleep that wakes early on shutdown. Returns true when shutting down.
    fn sleep_cancellable(&self, duration: Duration) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            return true;
        }
        match self.shutdown_rx.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.shutdown.load(Ordering::Relaxed),
        }
    }

    fn write_control(&self, byte: u8) {
        self.transport.lock().write(&[byte]);
    }

    /// Queue a message, rerouting to the wake-up queue when the target is a
    /// sleeping battery device.
    fn enqueue_message(&self, msg: Message) {
        {
            let mut nodes = self.nodes.lock();
            if let Some(record) = nodes.get_mut(msg.target_node_id()) {
                if record.should_redirect() {
                    if msg.is_wake_up_no_more_information() {
                        log::debug!("dropping no-more-information for sleeping node {}", record.node_id);
                    } else {
                        record.queue_pending(msg);
                    }
                    return;
                }
            }
        }
        self.engine.enqueue(msg);
    }

    /// Queue an application payload for encapsulated delivery.
    fn queue_secure(&self, node_id: u8, payload: &[u8]) -> Result<(), DriverError> {
        let needs_request = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&node_id)
                .ok_or(DriverError::NoSecuritySession(node_id))?;
            session.queue_payload(payload)?;
            session.needs_nonce_request()
        };
        if needs_request {
            self.enqueue_nonce_request(node_id);
        }
        Ok(())
    }

    /// Send a NonceGet and arm the session's nonce window.
    fn enqueue_nonce_request(&self, node_id: u8) {
        if let Some(session) = self.sessions.lock().get_mut(&node_id) {
            session.note_nonce_requested(Instant::now());
        }
        DriverStatistics::inc(&self.stats.nonce_requests);
        match Message::send_data(
            "SecurityCmd_NonceGet",
            node_id,
            &[COMMAND_CLASS_SECURITY, SECURITY_CMD_NONCE_GET],
            Some(FUNC_ID_APPLICATION_COMMAND_HANDLER),
            Some(COMMAND_CLASS_SECURITY),
        ) {
            Ok(msg) => self.enqueue_message(msg),
            Err(e) => log::error!("failed to build nonce request: {}", e),
        }
    }

    /// Mark a device asleep and move everything queued for it (the
    /// in-flight message included) to its wake-up queue, preserving order.
    fn move_node_to_wakeup(&self, node_id: u8) {
        let taken = self.engine.take_messages_for_node(node_id);
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.is_awake = false;
                for msg in taken {
                    if msg.is_wake_up_no_more_information() {
                        log::debug!("dropping no-more-information for sleeping node {}", node_id);
                    } else {
                        record.queue_pending(msg);
                    }
                }
            }
            None => {
                log::warn!(
                    "node {} unknown, dropping {} unanswered message(s)",
                    node_id,
                    taken.len()
                );
            }
        }
    }

    /// A sleeping device announced it is awake: flush its backlog in order,
    /// preceded by any poll it is owed.
    fn handle_wakeup_notification(&self, node_id: u8) {
        let (pending, poll_owed) = {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(node_id) {
                Some(record) => {
                    record.is_awake = true;
                    (record.take_pending(), std::mem::take(&mut record.poll_on_wake))
                }
                None => return,
            }
        };
        log::info!(
            "node {} woke up, flushing {} pending message(s)",
            node_id,
            pending.len()
        );
        if poll_owed {
            self.engine.enqueue(Message::request_node_info(node_id));
        }
        for msg in pending {
            self.engine.enqueue(msg);
        }
    }

    /// Re-key or give up on sessions whose nonce request got no answer
    /// within the validity window.
    fn check_nonce_timeouts(&self) {
        let now = Instant::now();
        let mut rerequest = Vec::new();
        let mut degraded = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            for (&node_id, session) in sessions.iter_mut() {
                if session.nonce_request_expired(now) {
                    if session.record_nonce_failure() {
                        degraded.push(node_id);
                    } else {
                        rerequest.push(node_id);
                    }
                }
            }
        }
        for node_id in degraded {
            self.mark_secure_degraded(node_id);
        }
        for node_id in rerequest {
            log::warn!("nonce request to node {} unanswered, re-requesting", node_id);
            self.enqueue_nonce_request(node_id);
        }
    }

    fn mark_secure_degraded(&self, node_id: u8) {
        log::error!("secure communication with node {} degraded", node_id);
        if let Some(record) = self.nodes.lock().get_mut(node_id) {
            record.secure_degraded = true;
        }
    }

    fn apply_bootstrap_action(&self, node_id: u8, action: BootstrapAction) {
        match action {
            BootstrapAction::None => {}
            BootstrapAction::SendPlain(payload) => {
                match Message::send_data(
                    "SecurityCmd_Bootstrap",
                    node_id,
                    &payload,
                    Some(FUNC_ID_APPLICATION_COMMAND_HANDLER),
                    Some(COMMAND_CLASS_SECURITY),
                ) {
                    Ok(msg) => self.enqueue_message(msg),
                    Err(e) => log::error!("failed to build bootstrap message: {}", e),
                }
            }
            BootstrapAction::SendEncrypted(payload) => {
                if let Err(e) = self.queue_secure(node_id, &payload) {
                    log::error!("failed to queue bootstrap payload for node {}: {}", node_id, e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    fn process_input(&self, input: LinkInput, codec: &mut FrameCodec) {
        match input {
            LinkInput::Control(ControlByte::Ack) => self.engine.on_ack(),
            LinkInput::Control(ControlByte::Nak) => {
                self.engine.on_nak(&self.transport);
            }
            LinkInput::Control(ControlByte::Can) => {
                self.engine.on_can(&self.transport);
            }
            LinkInput::Frame(payload) => {
                DriverStatistics::inc(&self.stats.frames_received);
                log::trace!("received frame: {}", hex::encode(&payload));
                self.write_control(ACK);
                self.process_frame(&payload);
            }
            LinkInput::BadChecksum { expected, actual } => {
                DriverStatistics::inc(&self.stats.bad_checksums);
                log::warn!(
                    "checksum incorrect (expected 0x{:02X}, got 0x{:02X}) - sending NAK",
                    expected,
                    actual
                );
                self.write_control(NAK);
            }
            LinkInput::OutOfFrame(byte) => {
                DriverStatistics::inc(&self.stats.out_of_frame);
                log::warn!("out of frame flow (0x{:02X}) - sending NAK", byte);
                codec.clear();
                self.write_control(NAK);
            }
        }
    }

    fn process_frame(&self, payload: &[u8]) {
        if payload.len() < 2 {
            log::warn!("frame payload too short ({} bytes)", payload.len());
            return;
        }
        let msg_type = payload[0];
        let function = payload[1];

        match function {
            FUNC_ID_ZW_SEND_DATA if msg_type == RESPONSE => {
                // Controller accepted (1) or rejected (0) the send.
                if payload.get(2) == Some(&0) {
                    log::warn!("send-data rejected by controller, retrying");
                    self.engine.retry_current(&self.transport);
                }
            }
            FUNC_ID_ZW_SEND_DATA if msg_type == REQUEST => {
                // Delivery callback: [callback id][tx status]
                if payload.len() < 4 {
                    log::warn!("truncated send-data callback");
                    return;
                }
                let callback_id = payload[2];
                let status = payload[3];
                if status == TRANSMIT_COMPLETE_OK {
                    self.engine.on_callback(callback_id);
                } else {
                    log::warn!(
                        "send-data callback 0x{:02X} reports failure 0x{:02X}",
                        callback_id,
                        status
                    );
                    if let Some(node_id) = self.engine.current_target() {
                        if self.nodes.lock().is_sleeper(node_id) {
                            self.move_node_to_wakeup(node_id);
                        } else {
                            self.engine.retry_current(&self.transport);
                        }
                    }
                }
            }
            FUNC_ID_APPLICATION_COMMAND_HANDLER => {
                // [rx status][src node][len][command class][command]...
                if payload.len() < 6 {
                    log::warn!("truncated application command");
                    return;
                }
                let src_node = payload[3];
                let len = payload[4] as usize;
                let app = match payload.get(5..5 + len) {
                    Some(app) if app.len() >= 2 => app,
                    _ => {
                        log::warn!("application command length mismatch");
                        return;
                    }
                };
                self.engine.on_reply(function, Some(app[0]), Some(src_node));
                self.handle_application_command(src_node, app);
            }
            _ => {
                // Application updates and the rest of the Serial API: only
                // interesting when a transaction is waiting on them.
                self.engine.on_reply(function, None, None);
            }
        }
    }

    fn handle_application_command(&self, node_id: u8, app: &[u8]) {
        let command_class = app[0];
        match command_class {
            COMMAND_CLASS_SECURITY => self.handle_security_command(node_id, &app[1..]),
            COMMAND_CLASS_WAKE_UP if app[1] == WAKE_UP_CMD_NOTIFICATION => {
                self.handle_wakeup_notification(node_id)
            }
            _ => {
                if let Err(e) = self.dispatcher.dispatch(node_id, 1, command_class, &app[1..]) {
                    log::warn!("dispatch failed for node {}: {}", node_id, e);
                }
            }
        }
    }

    /// Handle a security command, `sec` starting at the command byte.
    fn handle_security_command(&self, node_id: u8, sec: &[u8]) {
        if sec.is_empty() {
            return;
        }
        let now = Instant::now();
        match sec[0] {
            SECURITY_CMD_NONCE_GET => self.send_nonce_report(node_id, now),
            SECURITY_CMD_NONCE_REPORT => {
                if sec.len() < 9 {
                    log::warn!("truncated nonce report from node {}", node_id);
                    return;
                }
                let mut nonce = [0u8; 8];
                nonce.copy_from_slice(&sec[1..9]);
                let outcome = match self.sessions.lock().get_mut(&node_id) {
                    Some(session) => session.on_nonce_received(
                        &nonce,
                        now,
                        self.config.controller_node_id,
                        node_id,
                    ),
                    None => {
                        log::warn!("nonce report from node {} with no session", node_id);
                        return;
                    }
                };
                self.apply_nonce_outcome(node_id, outcome);
            }
            SECURITY_CMD_MESSAGE_ENCAP | SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET => {
                let result = match self.sessions.lock().get_mut(&node_id) {
                    Some(session) => {
                        session.decrypt(sec, now, node_id, self.config.controller_node_id)
                    }
                    None => {
                        log::warn!("encapsulated message from node {} with no session", node_id);
                        return;
                    }
                };
                match result {
                    Ok(Some(plaintext)) => self.handle_secure_plaintext(node_id, &plaintext),
                    Ok(None) => log::debug!("stored first fragment from node {}", node_id),
                    Err(e) => {
                        // Indistinguishable from a transport error on
                        // purpose; just count and drop.
                        DriverStatistics::inc(&self.stats.secure_drops);
                        log::warn!("dropping encapsulated frame from node {}: {}", node_id, e);
                        if let SecurityError::FragmentSequenceMismatch { .. } = e {
                            log::info!("restarting secure exchange with node {}", node_id);
                        }
                    }
                }
                if sec[0] == SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET {
                    // The far end has more fragments and wants the next
                    // nonce straight away.
                    self.send_nonce_report(node_id, now);
                }
            }
            SECURITY_CMD_SCHEME_REPORT => {
                if sec.len() < 2 {
                    return;
                }
                let key = match *self.network_key.lock() {
                    Some(key) => key,
                    None => {
                        log::warn!("scheme report from node {} but no network key set", node_id);
                        return;
                    }
                };
                let action = self
                    .bootstraps
                    .lock()
                    .entry(node_id)
                    .or_default()
                    .on_scheme_report(sec[1], &key);
                self.apply_bootstrap_action(node_id, action);
            }
            SECURITY_CMD_NETWORK_KEY_VERIFY => {
                let action = self
                    .bootstraps
                    .lock()
                    .entry(node_id)
                    .or_default()
                    .on_network_key_verify();
                self.apply_bootstrap_action(node_id, action);
            }
            SECURITY_CMD_SUPPORTED_REPORT => {
                // [command][reports to follow][class ids...]
                let classes = sec.get(2..).unwrap_or(&[]).to_vec();
                if let Some(bootstrap) = self.bootstraps.lock().get_mut(&node_id) {
                    bootstrap.on_supported_report(&classes);
                }
                if let Some(record) = self.nodes.lock().get_mut(node_id) {
                    record.secured_classes = classes;
                }
                if let Err(e) = self.dispatcher.dispatch(node_id, 1, COMMAND_CLASS_SECURITY, sec) {
                    log::warn!("dispatch failed for node {}: {}", node_id, e);
                }
            }
            other => {
                log::debug!(
                    "unhandled security command 0x{:02X} from node {}",
                    other,
                    node_id
                );
            }
        }
    }

    fn send_nonce_report(&self, node_id: u8, now: Instant) {
        let nonce = match self.sessions.lock().get_mut(&node_id) {
            Some(session) => session.generate_report(now),
            None => {
                log::warn!("nonce requested by node {} with no session", node_id);
                return;
            }
        };
        let mut payload = Vec::with_capacity(10);
        payload.push(COMMAND_CLASS_SECURITY);
        payload.push(SECURITY_CMD_NONCE_REPORT);
        payload.extend_from_slice(&nonce);
        match Message::send_data("SecurityCmd_NonceReport", node_id, &payload, None, None) {
            Ok(msg) => self.enqueue_message(msg),
            Err(e) => log::error!("failed to build nonce report: {}", e),
        }
    }

    fn apply_nonce_outcome(&self, node_id: u8, outcome: NonceOutcome) {
        match outcome {
            NonceOutcome::Encapsulated { payload, more } => {
                let description = if more {
                    "SecurityCmd_MessageEncapNonceGet"
                } else {
                    "SecurityCmd_MessageEncap"
                };
                let mut app = Vec::with_capacity(1 + payload.len());
                app.push(COMMAND_CLASS_SECURITY);
                app.extend_from_slice(&payload);
                match Message::send_data(description, node_id, &app, None, None) {
                    Ok(msg) => self.enqueue_message(msg),
                    Err(e) => log::error!("failed to build encapsulation: {}", e),
                }
            }
            NonceOutcome::Expired { degraded } => {
                if degraded {
                    self.mark_secure_degraded(node_id);
                } else {
                    self.enqueue_nonce_request(node_id);
                }
            }
            NonceOutcome::Idle => {}
        }
    }

    fn handle_secure_plaintext(&self, node_id: u8, plaintext: &[u8]) {
        if plaintext.len() < 2 {
            log::warn!("decrypted payload from node {} too short", node_id);
            return;
        }
        let command_class = plaintext[0];
        if command_class == COMMAND_CLASS_SECURITY {
            // Bootstrap replies (key verify, supported report) arrive
            // encapsulated.
            self.handle_security_command(node_id, &plaintext[1..]);
        } else if let Err(e) = self
            .dispatcher
            .dispatch(node_id, 1, command_class, &plaintext[1..])
        {
            log::warn!("dispatch failed for node {}: {}", node_id, e);
        }
    }
}

// ============================================================================
// Thread bodies
// ============================================================================

/// Reader: owns the frame codec and drives everything inbound.
fn run_reader(shared: Arc<Shared>) {
    let mut codec = FrameCodec::new();
    let grain = shared.config.wait_grain();
    let stall = shared.config.read_stall_timeout();
    let mut buf = [0u8; MAX_FRAME_SIZE];
    let mut inputs = Vec::new();

    while !shared.shutdown.load(Ordering::Relaxed) {
        {
            let mut transport = shared.transport.lock();
            if transport.wait(grain) {
                // Keep the port until no frame is mid-flight, so the sender
                // cannot interleave a write with a partial read.
                loop {
                    let n = transport.read(&mut buf);
                    if n > 0 {
                        codec.push(&buf[..n]);
                    }
                    while let Some(input) = codec.decode() {
                        inputs.push(input);
                    }
                    if !codec.has_partial_frame() {
                        break;
                    }
                    if codec.purge_stalled(stall) {
                        DriverStatistics::inc(&shared.stats.read_aborts);
                        break;
                    }
                    if shared.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    transport.wait(Duration::from_millis(10));
                }
            }
        }
        for input in inputs.drain(..) {
            shared.process_input(input, &mut codec);
        }
    }
}

/// Sender: one wire write per wake, retry window re-armed each time.
fn run_sender(shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        shared.check_nonce_timeouts();
        match shared.engine.plan(Instant::now()) {
            crate::Plan::WriteNext => {
                shared.engine.write_next(&shared.transport);
            }
            crate::Plan::Timeout { node_id } => {
                log::warn!("no response within the retry window (node {})", node_id);
                if shared.nodes.lock().is_sleeper(node_id) {
                    log::info!(
                        "node {} not responding - moving its messages to the wake-up queue",
                        node_id
                    );
                    shared.move_node_to_wakeup(node_id);
                } else {
                    shared.engine.retry_current(&shared.transport);
                }
            }
            crate::Plan::Wait(duration) => shared.engine.wait_for_work(duration),
        }
    }
}

/// Poller: walks the rotation, spreading the interval across the list.
fn run_poller(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let interval = shared.config.poll_interval();

        let (due, len) = {
            let mut poll = shared.poll.lock();
            let len = poll.len();
            (poll.advance(), len)
        };
        if len == 0 {
            if shared.sleep_cancellable(interval) {
                return;
            }
            continue;
        }
        let node_id = match due {
            Some(node_id) => node_id,
            // Intensity counter only decremented; service the next entry.
            None => continue,
        };

        // Polls only go out when no other traffic is waiting.
        while shared.engine.queue_len() > 0 || shared.engine.in_flight() {
            if shared.sleep_cancellable(Duration::from_millis(20)) {
                return;
            }
        }

        let asleep = shared.nodes.lock().should_redirect(node_id);
        if asleep {
            log::debug!("node {} asleep - poll owed at next wake", node_id);
            if let Some(record) = shared.nodes.lock().get_mut(node_id) {
                record.poll_on_wake = true;
            }
        } else {
            shared.enqueue_message(Message::request_node_info(node_id));
        }

        let per_device = if shared.config.interval_between_polls {
            interval
        } else {
            interval / len.max(1) as u32
        };
        if shared.sleep_cancellable(per_device) {
            return;
        }
    }
}
