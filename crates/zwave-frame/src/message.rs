//! Outbound message building.
//!
//! A [`Message`] is one unit of work for the transaction engine: the raw
//! frame bytes, the function code they carry, what kind of answer completes
//! the transaction, and how many times the message has been put on the wire.
//! Messages are built incrementally with [`push`](Message::push) and then
//! sealed with [`finalize`](Message::finalize), which assigns the callback
//! id and fills in the length and checksum.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    checksum, FrameError, COMMAND_CLASS_WAKE_UP, FUNC_ID_ZW_APPLICATION_UPDATE,
    FUNC_ID_ZW_REQUEST_NODE_INFO, FUNC_ID_ZW_SEND_DATA, MAX_FRAME_SIZE, MAX_MAX_TRIES, MAX_TRIES,
    REQUEST, SOF, TRANSMIT_OPTIONS_DEFAULT, WAKE_UP_CMD_NO_MORE_INFORMATION,
};

/// Allocator for transaction callback ids.
///
/// Ids cycle through 1..=255; zero is never handed out because a zero
/// callback byte means "no callback" on the wire.
#[derive(Debug)]
pub struct CallbackIds {
    next: AtomicU8,
}

impl CallbackIds {
    /// Create an allocator starting at id 1.
    pub fn new() -> Self {
        CallbackIds {
            next: AtomicU8::new(1),
        }
    }

    /// Take the next callback id.
    pub fn next(&self) -> u8 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for CallbackIds {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound message, immutable once queued.
#[derive(Debug, Clone)]
pub struct Message {
    /// Human-readable description for logging.
    description: String,
    /// Target node id.
    target_node_id: u8,
    /// The frame being built: SOF, length, type, function, data.
    buffer: Vec<u8>,
    /// Whether length/checksum/callback have been filled in.
    finalized: bool,
    /// Whether the controller should deliver a completion callback.
    callback_required: bool,
    /// Callback id assigned at finalization (0 = none).
    callback_id: u8,
    /// Function code that completes the transaction (0 = none expected).
    expected_reply: u8,
    /// Command class expected in an application-command reply (0 = any).
    expected_command_class: u8,
    /// Number of times this message has been written to the wire.
    send_attempts: u8,
    /// Attempt bound; raised by CAN handling, capped at [`MAX_MAX_TRIES`].
    max_send_attempts: u8,
    /// Route through the security encapsulation layer before sending.
    secure: bool,
}

impl Message {
    /// Create a new request message.
    ///
    /// When `reply_required` is set and `expected_reply` is `None`, the
    /// function code itself is the expected reply, which is the common case
    /// for simple request/response exchanges.
    pub fn new(
        description: impl Into<String>,
        target_node_id: u8,
        function: u8,
        callback_required: bool,
        reply_required: bool,
        expected_reply: Option<u8>,
        expected_command_class: Option<u8>,
    ) -> Self {
        let expected_reply = if reply_required {
            expected_reply.unwrap_or(function)
        } else {
            0
        };

        Message {
            description: description.into(),
            target_node_id,
            buffer: vec![SOF, 0, REQUEST, function],
            finalized: false,
            callback_required,
            callback_id: 0,
            expected_reply,
            expected_command_class: expected_command_class.unwrap_or(0),
            send_attempts: 0,
            max_send_attempts: MAX_TRIES,
            secure: false,
        }
    }

    /// Build a send-data message carrying an application payload
    /// (command class byte onward) to a node.
    pub fn send_data(
        description: impl Into<String>,
        target_node_id: u8,
        application_payload: &[u8],
        expected_reply: Option<u8>,
        expected_command_class: Option<u8>,
    ) -> Result<Self, FrameError> {
        if application_payload.len() > u8::MAX as usize {
            return Err(FrameError::FrameTooLong {
                max: u8::MAX as usize,
                actual: application_payload.len(),
            });
        }

        let mut msg = Message::new(
            description,
            target_node_id,
            FUNC_ID_ZW_SEND_DATA,
            true,
            true,
            expected_reply,
            expected_command_class,
        );
        msg.push(target_node_id)?;
        msg.push(application_payload.len() as u8)?;
        for &byte in application_payload {
            msg.push(byte)?;
        }
        msg.push(TRANSMIT_OPTIONS_DEFAULT)?;
        Ok(msg)
    }

    /// Build a request for a node's information frame, completed by the
    /// application-update callback.
    pub fn request_node_info(target_node_id: u8) -> Self {
        let mut msg = Message::new(
            "RequestNodeInfo",
            target_node_id,
            FUNC_ID_ZW_REQUEST_NODE_INFO,
            false,
            true,
            Some(FUNC_ID_ZW_APPLICATION_UPDATE),
            None,
        );
        // Infallible: the header leaves ample room for one byte.
        let _ = msg.push(target_node_id);
        msg
    }

    /// Build a "wake up, no more information" message telling a battery
    /// device it may go back to sleep.
    pub fn wake_up_no_more_information(target_node_id: u8) -> Result<Self, FrameError> {
        Message::send_data(
            "WakeUpCmd_NoMoreInformation",
            target_node_id,
            &[COMMAND_CLASS_WAKE_UP, WAKE_UP_CMD_NO_MORE_INFORMATION],
            None,
            None,
        )
    }

    /// Add a byte to the message.
    pub fn push(&mut self, data: u8) -> Result<(), FrameError> {
        if self.finalized {
            return Err(FrameError::InvalidMessage(
                "push after finalize".to_string(),
            ));
        }
        if self.buffer.len() + 3 > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLong {
                max: MAX_FRAME_SIZE,
                actual: self.buffer.len() + 3,
            });
        }
        self.buffer.push(data);
        Ok(())
    }

    /// Fill in the callback id, length, and checksum.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn finalize(&mut self, ids: &CallbackIds) {
        if self.finalized {
            return;
        }

        if self.callback_required {
            self.buffer[1] = self.buffer.len() as u8;
            self.callback_id = ids.next();
            self.buffer.push(self.callback_id);
        } else {
            self.buffer[1] = (self.buffer.len() - 1) as u8;
        }

        let cs = checksum(&self.buffer[1..]);
        self.buffer.push(cs);
        self.finalized = true;
    }

    /// The complete frame bytes. Only meaningful after finalization.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether the message has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Target node id.
    pub fn target_node_id(&self) -> u8 {
        self.target_node_id
    }

    /// The Serial API function code this message carries.
    pub fn function(&self) -> u8 {
        self.buffer[3]
    }

    /// Callback id assigned at finalization.
    pub fn callback_id(&self) -> Option<u8> {
        if self.callback_id != 0 {
            Some(self.callback_id)
        } else {
            None
        }
    }

    /// Function code whose arrival completes the transaction.
    pub fn expected_reply(&self) -> Option<u8> {
        if self.expected_reply != 0 {
            Some(self.expected_reply)
        } else {
            None
        }
    }

    /// Command class expected in an application-command reply.
    pub fn expected_command_class(&self) -> Option<u8> {
        if self.expected_command_class != 0 {
            Some(self.expected_command_class)
        } else {
            None
        }
    }

    /// Number of completed wire writes.
    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    /// Record one more wire write.
    pub fn increment_send_attempts(&mut self) {
        self.send_attempts = self.send_attempts.saturating_add(1);
    }

    /// Whether the attempt budget is spent.
    pub fn attempts_exhausted(&self) -> bool {
        self.send_attempts >= self.max_send_attempts
    }

    /// Current attempt bound.
    pub fn max_send_attempts(&self) -> u8 {
        self.max_send_attempts
    }

    /// Grant one extra attempt, up to [`MAX_MAX_TRIES`]. Used when the
    /// controller CANs an exchange through no fault of the target node.
    pub fn extend_max_attempts(&mut self) {
        if self.max_send_attempts < MAX_MAX_TRIES {
            self.max_send_attempts += 1;
        }
    }

    /// Set the attempt bound. Applied by the transaction engine at enqueue
    /// time when the configured bound differs from the default.
    pub fn set_max_send_attempts(&mut self, max: u8) {
        self.max_send_attempts = max.max(1);
    }

    /// Mark this message for security encapsulation.
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Whether this message must be routed through security encapsulation.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// The application payload (command class byte onward) of a send-data
    /// message, or `None` for other functions.
    pub fn application_payload(&self) -> Option<&[u8]> {
        if self.function() != FUNC_ID_ZW_SEND_DATA || self.buffer.len() < 6 {
            return None;
        }
        let len = self.buffer[5] as usize;
        self.buffer.get(6..6 + len)
    }

    /// Whether this is a "wake up, no more information" command. These are
    /// dropped rather than queued when their target is asleep.
    pub fn is_wake_up_no_more_information(&self) -> bool {
        self.application_payload()
            == Some(&[COMMAND_CLASS_WAKE_UP, WAKE_UP_CMD_NO_MORE_INFORMATION][..])
    }

    /// Description for logging.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Render the message for log output.
    pub fn as_log_string(&self) -> String {
        format!(
            "{} (node {}): {}",
            self.description,
            self.target_node_id,
            hex::encode(&self.buffer)
        )
    }
}
