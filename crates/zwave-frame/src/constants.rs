//! Protocol constants
//!
//! These constants define the link-layer control bytes, Serial API function
//! ids, and command class values used by the driver core. All values are
//! fixed by the Z-Wave protocol; none of them are tunables.

// ============================================================================
// Link-layer control bytes
// ============================================================================

/// Start of a framed message.
pub const SOF: u8 = 0x01;
/// Frame received and checksum verified.
pub const ACK: u8 = 0x06;
/// Frame received with a bad checksum - sender should retransmit.
pub const NAK: u8 = 0x15;
/// Controller cancelled the exchange - sender should retransmit.
pub const CAN: u8 = 0x18;

// ============================================================================
// Message types (payload byte 0)
// ============================================================================

/// Host-initiated request, or an unsolicited callback from the controller.
pub const REQUEST: u8 = 0x00;
/// Immediate response to a request.
pub const RESPONSE: u8 = 0x01;

// ============================================================================
// Serial API function ids (payload byte 1)
// ============================================================================

/// Deliver an application-level command received from a node.
pub const FUNC_ID_APPLICATION_COMMAND_HANDLER: u8 = 0x04;
/// Send application data to a node.
pub const FUNC_ID_ZW_SEND_DATA: u8 = 0x13;
/// Get protocol capabilities (listening flag, device class) for a node.
pub const FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO: u8 = 0x41;
/// Node information frame received, or a request-node-info completed.
pub const FUNC_ID_ZW_APPLICATION_UPDATE: u8 = 0x49;
/// Ask a node to send its node information frame.
pub const FUNC_ID_ZW_REQUEST_NODE_INFO: u8 = 0x60;

// ============================================================================
// Transmit options for FUNC_ID_ZW_SEND_DATA
// ============================================================================

/// Request a radio-level acknowledgement from the destination.
pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
/// Allow routed delivery through repeater nodes.
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
/// Allow explorer frames when no route is known.
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;

/// Default transmit options for outbound application data.
pub const TRANSMIT_OPTIONS_DEFAULT: u8 =
    TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE | TRANSMIT_OPTION_EXPLORE;

// ============================================================================
// Send-data callback status values
// ============================================================================

/// Destination acknowledged the transmission.
pub const TRANSMIT_COMPLETE_OK: u8 = 0x00;
/// No acknowledgement from the destination.
pub const TRANSMIT_COMPLETE_NO_ACK: u8 = 0x01;
/// Transmission failed inside the controller.
pub const TRANSMIT_COMPLETE_FAIL: u8 = 0x02;

// ============================================================================
// Command classes the core itself understands
// ============================================================================

/// Wake-up command class (battery devices announcing their wake windows).
pub const COMMAND_CLASS_WAKE_UP: u8 = 0x84;
/// Security (S0) encapsulation command class.
pub const COMMAND_CLASS_SECURITY: u8 = 0x98;

/// Wake-up notification from a sleeping device.
pub const WAKE_UP_CMD_NOTIFICATION: u8 = 0x07;
/// Tell a device it may go back to sleep.
pub const WAKE_UP_CMD_NO_MORE_INFORMATION: u8 = 0x08;

// ============================================================================
// Security command codes (command class 0x98, byte 1 of the payload)
// ============================================================================

/// Ask which command classes the device supports securely.
pub const SECURITY_CMD_SUPPORTED_GET: u8 = 0x02;
/// List of securely supported command classes.
pub const SECURITY_CMD_SUPPORTED_REPORT: u8 = 0x03;
/// Ask which security schemes the device supports.
pub const SECURITY_CMD_SCHEME_GET: u8 = 0x04;
/// Security scheme agreement from the device.
pub const SECURITY_CMD_SCHEME_REPORT: u8 = 0x05;
/// Deliver the network key (sent encrypted).
pub const SECURITY_CMD_NETWORK_KEY_SET: u8 = 0x06;
/// Device confirms it can use the delivered network key.
pub const SECURITY_CMD_NETWORK_KEY_VERIFY: u8 = 0x07;
/// Inherit a scheme during controller replication.
pub const SECURITY_CMD_SCHEME_INHERIT: u8 = 0x08;
/// Request a nonce for an upcoming encapsulated message.
pub const SECURITY_CMD_NONCE_GET: u8 = 0x40;
/// Carry a freshly generated nonce.
pub const SECURITY_CMD_NONCE_REPORT: u8 = 0x80;
/// Encapsulated (encrypted + authenticated) message, final fragment.
pub const SECURITY_CMD_MESSAGE_ENCAP: u8 = 0x81;
/// Encapsulated message with more fragments queued - send another nonce.
pub const SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET: u8 = 0xC1;

// ============================================================================
// Sizing
// ============================================================================

/// Maximum size of a complete frame (SOF through checksum).
pub const MAX_FRAME_SIZE: usize = 256;

/// Number of send attempts before a message is dropped.
pub const MAX_TRIES: u8 = 3;

/// Upper bound on the attempt count after CAN-triggered extensions.
pub const MAX_MAX_TRIES: u8 = 7;
