//! Inclusion bootstrap for securely added devices.
//!
//! A device joining the network secure must agree on a scheme, receive the
//! network key, and prove it can use it before normal encapsulated traffic
//! starts:
//!
//! 1. host sends `SchemeGet` (unencrypted)
//! 2. device answers `SchemeReport`; scheme 0 means agreement
//! 3. host sends `NetworkKeySet` (encrypted under the temporary key)
//! 4. device answers `NetworkKeyVerify` (encrypted under the new key)
//! 5. host sends `SupportedGet`; the `SupportedReport` lists the command
//!    classes the device will only accept encapsulated
//!
//! The driver owns the message plumbing; this module only tracks where in
//! the handshake a device is and which payload goes out next.

use zwave_frame::{
    COMMAND_CLASS_SECURITY, SECURITY_CMD_NETWORK_KEY_SET, SECURITY_CMD_SCHEME_GET,
    SECURITY_CMD_SUPPORTED_GET,
};

use crate::NetworkKey;

/// The only scheme this implementation speaks (scheme 0).
pub const SECURITY_SCHEME_ZERO: u8 = 0x00;

/// Where a device is in the inclusion handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Handshake not started.
    Idle,
    /// SchemeGet sent, waiting for the report.
    SchemeRequested,
    /// Scheme agreed, network key on its way.
    KeySent,
    /// Key verified, waiting for the supported-classes report.
    Verified,
    /// Handshake finished; normal encapsulated traffic may flow.
    Complete,
    /// No common scheme; the device continues unsecured.
    Failed,
}

/// Next payload the driver should send, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    /// Nothing to send.
    None,
    /// Send this application payload unencrypted.
    SendPlain(Vec<u8>),
    /// Send this application payload through the encapsulation layer.
    SendEncrypted(Vec<u8>),
}

/// Bootstrap handshake tracker for one device.
#[derive(Debug)]
pub struct Bootstrap {
    state: BootstrapState,
}

impl Bootstrap {
    /// Create a tracker in the idle state.
    pub fn new() -> Self {
        Bootstrap {
            state: BootstrapState::Idle,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Start the handshake. Returns the SchemeGet payload to send
    /// unencrypted.
    pub fn begin(&mut self) -> BootstrapAction {
        self.state = BootstrapState::SchemeRequested;
        BootstrapAction::SendPlain(vec![
            COMMAND_CLASS_SECURITY,
            SECURITY_CMD_SCHEME_GET,
            SECURITY_SCHEME_ZERO,
        ])
    }

    /// Handle a SchemeReport. With scheme 0 agreed, the network key goes
    /// out encrypted; repeated reports after agreement are ignored.
    pub fn on_scheme_report(&mut self, schemes: u8, key: &NetworkKey) -> BootstrapAction {
        match self.state {
            BootstrapState::SchemeRequested => {
                if schemes == SECURITY_SCHEME_ZERO {
                    log::info!("security scheme agreed, delivering network key");
                    self.state = BootstrapState::KeySent;
                    let mut payload = Vec::with_capacity(18);
                    payload.push(COMMAND_CLASS_SECURITY);
                    payload.push(SECURITY_CMD_NETWORK_KEY_SET);
                    payload.extend_from_slice(&key.0);
                    BootstrapAction::SendEncrypted(payload)
                } else {
                    log::warn!(
                        "no common security scheme (0x{:02X}), device continues unsecured",
                        schemes
                    );
                    self.state = BootstrapState::Failed;
                    BootstrapAction::None
                }
            }
            _ => {
                log::warn!("ignoring SchemeReport in state {:?}", self.state);
                BootstrapAction::None
            }
        }
    }

    /// Handle a NetworkKeyVerify. Receiving it at all proves the device can
    /// encrypt under the delivered key; ask for its secured classes.
    pub fn on_network_key_verify(&mut self) -> BootstrapAction {
        match self.state {
            BootstrapState::KeySent => {
                self.state = BootstrapState::Verified;
                BootstrapAction::SendEncrypted(vec![
                    COMMAND_CLASS_SECURITY,
                    SECURITY_CMD_SUPPORTED_GET,
                ])
            }
            _ => {
                log::warn!("ignoring NetworkKeyVerify in state {:?}", self.state);
                BootstrapAction::None
            }
        }
    }

    /// Handle a SupportedReport. Returns the secured command class list for
    /// the device model; the handshake is complete.
    pub fn on_supported_report(&mut self, data: &[u8]) -> Vec<u8> {
        self.state = BootstrapState::Complete;
        data.to_vec()
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: NetworkKey = NetworkKey([0x01; 16]);

    #[test]
    fn test_happy_path() {
        let mut bootstrap = Bootstrap::new();
        assert_eq!(bootstrap.state(), BootstrapState::Idle);

        match bootstrap.begin() {
            BootstrapAction::SendPlain(payload) => {
                assert_eq!(payload[..2], [COMMAND_CLASS_SECURITY, SECURITY_CMD_SCHEME_GET]);
            }
            other => panic!("unexpected action {:?}", other),
        }

        match bootstrap.on_scheme_report(SECURITY_SCHEME_ZERO, &KEY) {
            BootstrapAction::SendEncrypted(payload) => {
                assert_eq!(payload[1], SECURITY_CMD_NETWORK_KEY_SET);
                assert_eq!(&payload[2..], &KEY.0);
            }
            other => panic!("unexpected action {:?}", other),
        }

        match bootstrap.on_network_key_verify() {
            BootstrapAction::SendEncrypted(payload) => {
                assert_eq!(payload, vec![COMMAND_CLASS_SECURITY, SECURITY_CMD_SUPPORTED_GET]);
            }
            other => panic!("unexpected action {:?}", other),
        }

        let classes = bootstrap.on_supported_report(&[0x25, 0x26, 0x85]);
        assert_eq!(classes, vec![0x25, 0x26, 0x85]);
        assert_eq!(bootstrap.state(), BootstrapState::Complete);
    }

    #[test]
    fn test_no_common_scheme_fails() {
        let mut bootstrap = Bootstrap::new();
        bootstrap.begin();
        assert_eq!(
            bootstrap.on_scheme_report(0x02, &KEY),
            BootstrapAction::None
        );
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
    }

    #[test]
    fn test_repeated_scheme_report_ignored() {
        let mut bootstrap = Bootstrap::new();
        bootstrap.begin();
        bootstrap.on_scheme_report(SECURITY_SCHEME_ZERO, &KEY);
        assert_eq!(
            bootstrap.on_scheme_report(SECURITY_SCHEME_ZERO, &KEY),
            BootstrapAction::None
        );
        assert_eq!(bootstrap.state(), BootstrapState::KeySent);
    }

    #[test]
    fn test_unexpected_verify_ignored() {
        let mut bootstrap = Bootstrap::new();
        assert_eq!(bootstrap.on_network_key_verify(), BootstrapAction::None);
        assert_eq!(bootstrap.state(), BootstrapState::Idle);
    }
}
