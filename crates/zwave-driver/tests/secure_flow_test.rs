//! Integration tests for the security encapsulation flow: nonce exchange,
//! encrypted dispatch, tamper rejection, and outbound fragmentation, with
//! the test playing the remote device using the security crate's own
//! primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use zwave_driver::{
    CommandDispatcher, DispatchError, Driver, DriverConfig, MockTransport, MockTransportHandle,
};
use zwave_frame::{
    encode_frame, FrameCodec, LinkInput, Message, ACK, COMMAND_CLASS_SECURITY,
    FUNC_ID_APPLICATION_COMMAND_HANDLER, FUNC_ID_ZW_SEND_DATA, REQUEST,
    SECURITY_CMD_MESSAGE_ENCAP, SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET, SECURITY_CMD_NONCE_GET,
    SECURITY_CMD_NONCE_REPORT, TRANSMIT_COMPLETE_OK,
};
use zwave_security::{
    decode_encap, derive_auth_key, derive_encrypt_key, encode_encap, sequence_byte,
    verify_and_decrypt, FragmentPart, NetworkKey,
};

const KEY: NetworkKey = NetworkKey([0x0F; 16]);
const CONTROLLER: u8 = 1;
const NODE: u8 = 9;

// ============================================================================
// Helpers
// ============================================================================

fn fast_config() -> DriverConfig {
    DriverConfig {
        transaction_timeout_ms: 2_000,
        wait_grain_ms: 2,
        read_stall_timeout_ms: 50,
        poll_interval_ms: 10_000,
        ..DriverConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Dispatcher recording everything delivered to the device/value model.
#[derive(Default)]
struct CollectingDispatcher {
    received: Mutex<Vec<(u8, u8, Vec<u8>)>>,
}

impl CollectingDispatcher {
    fn received(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }
}

impl CommandDispatcher for CollectingDispatcher {
    fn dispatch(
        &self,
        node_id: u8,
        _instance: u8,
        command_class_id: u8,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        self.received
            .lock()
            .unwrap()
            .push((node_id, command_class_id, payload.to_vec()));
        Ok(())
    }
}

fn app_command_frame(node: u8, app: &[u8]) -> Vec<u8> {
    let mut payload = vec![
        REQUEST,
        FUNC_ID_APPLICATION_COMMAND_HANDLER,
        0x00,
        node,
        app.len() as u8,
    ];
    payload.extend_from_slice(app);
    encode_frame(&payload).expect("valid frame")
}

/// Controller-side responder: ACKs and completes every send-data frame the
/// driver writes, while collecting the frames for inspection.
struct Responder {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Responder {
    fn spawn(handle: MockTransportHandle) -> Self {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_frames = frames.clone();
        let thread_stop = stop.clone();

        let thread = thread::spawn(move || {
            let mut codec = FrameCodec::new();
            while !thread_stop.load(Ordering::Relaxed) {
                let bytes = handle.drain_written();
                if !bytes.is_empty() {
                    codec.push(&bytes);
                    while let Some(input) = codec.decode() {
                        if let LinkInput::Frame(payload) = input {
                            handle.inject(&[ACK]);
                            if payload.get(1) == Some(&FUNC_ID_ZW_SEND_DATA) && payload.len() > 4 {
                                let callback_id = payload[payload.len() - 1];
                                let frame = encode_frame(&[
                                    REQUEST,
                                    FUNC_ID_ZW_SEND_DATA,
                                    callback_id,
                                    TRANSMIT_COMPLETE_OK,
                                ])
                                .expect("valid frame");
                                handle.inject(&frame);
                            }
                            thread_frames.lock().unwrap().push(payload);
                        }
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        Responder {
            frames,
            stop,
            thread: Some(thread),
        }
    }

    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Application payloads of collected send-data frames, command class
    /// byte onward.
    fn send_data_payloads(&self) -> Vec<Vec<u8>> {
        self.frames()
            .iter()
            .filter(|f| f.get(1) == Some(&FUNC_ID_ZW_SEND_DATA))
            .filter_map(|f| {
                let len = *f.get(3)? as usize;
                f.get(4..4 + len).map(|app| app.to_vec())
            })
            .collect()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn secure_driver() -> (Driver, MockTransportHandle, Arc<CollectingDispatcher>) {
    let (transport, handle) = MockTransport::new();
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let mut driver = Driver::new(Box::new(transport), dispatcher.clone(), fast_config());
    driver.add_node(NODE, true, false);
    driver.set_network_key(KEY);
    driver.add_secure_node(NODE).expect("session");
    driver.start().expect("start");
    (driver, handle, dispatcher)
}

/// Ask the driver for a nonce (as the device would) and pull it out of the
/// NonceReport frame it writes.
fn obtain_reported_nonce(responder: &Responder, handle: &MockTransportHandle) -> [u8; 8] {
    let seen = responder.send_data_payloads().len();
    handle.inject(&app_command_frame(NODE, &[COMMAND_CLASS_SECURITY, SECURITY_CMD_NONCE_GET]));
    assert!(wait_until(Duration::from_secs(2), || {
        responder
            .send_data_payloads()
            .iter()
            .skip(seen)
            .any(|app| app.get(1) == Some(&SECURITY_CMD_NONCE_REPORT))
    }));
    let payloads = responder.send_data_payloads();
    let report = payloads
        .iter()
        .skip(seen)
        .find(|app| app.get(1) == Some(&SECURITY_CMD_NONCE_REPORT))
        .expect("nonce report");
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&report[2..10]);
    nonce
}

// ============================================================================
// Inbound: encrypted dispatch and tamper rejection
// ============================================================================

#[test]
fn test_encapsulated_report_reaches_dispatcher() {
    let (mut driver, handle, dispatcher) = secure_driver();
    let responder = Responder::spawn(handle.clone());

    let nonce = obtain_reported_nonce(&responder, &handle);

    // Device sends an encapsulated switch report under that nonce.
    let raw = encode_encap(
        SECURITY_CMD_MESSAGE_ENCAP,
        &derive_encrypt_key(&KEY),
        &derive_auth_key(&KEY),
        &[0x11; 8],
        &nonce,
        sequence_byte(FragmentPart::Whole, 0),
        &[0x25, 0x03, 0xFF],
        NODE,
        CONTROLLER,
    );
    let mut app = vec![COMMAND_CLASS_SECURITY];
    app.extend_from_slice(&raw);
    handle.inject(&app_command_frame(NODE, &app));

    assert!(wait_until(Duration::from_secs(2), || {
        dispatcher
            .received()
            .contains(&(NODE, 0x25, vec![0x03, 0xFF]))
    }));
    assert_eq!(driver.stats().secure_drops, 0);

    driver.shutdown();
}

#[test]
fn test_tampered_encapsulation_is_dropped_without_dispatch() {
    let (mut driver, handle, dispatcher) = secure_driver();
    let responder = Responder::spawn(handle.clone());

    let nonce = obtain_reported_nonce(&responder, &handle);

    let mut raw = encode_encap(
        SECURITY_CMD_MESSAGE_ENCAP,
        &derive_encrypt_key(&KEY),
        &derive_auth_key(&KEY),
        &[0x11; 8],
        &nonce,
        sequence_byte(FragmentPart::Whole, 0),
        &[0x25, 0x03, 0xFF],
        NODE,
        CONTROLLER,
    );
    // Flip one bit in the ciphertext.
    raw[10] ^= 0x01;
    let mut app = vec![COMMAND_CLASS_SECURITY];
    app.extend_from_slice(&raw);
    let before = dispatcher.received().len();
    handle.inject(&app_command_frame(NODE, &app));

    assert!(wait_until(Duration::from_secs(2), || {
        driver.stats().secure_drops == 1
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(dispatcher.received().len(), before);

    driver.shutdown();
}

// ============================================================================
// Outbound: nonce exchange and fragmentation
// ============================================================================

#[test]
fn test_secure_send_fragments_and_roundtrips_40_bytes() {
    let (mut driver, handle, _dispatcher) = secure_driver();
    let responder = Responder::spawn(handle.clone());

    let mut payload = [0u8; 40];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = i as u8;
    }

    let mut msg =
        Message::send_data("SecureCmd", NODE, &payload, None, None).expect("message");
    msg.set_secure(true);
    driver.send_message(msg).expect("queued");

    // The driver asks for a nonce first.
    assert!(wait_until(Duration::from_secs(2), || {
        responder
            .send_data_payloads()
            .iter()
            .any(|app| app.get(1) == Some(&SECURITY_CMD_NONCE_GET))
    }));

    // Device answers with its first nonce.
    let nonce1 = [0x21u8; 8];
    let mut report = vec![COMMAND_CLASS_SECURITY, SECURITY_CMD_NONCE_REPORT];
    report.extend_from_slice(&nonce1);
    handle.inject(&app_command_frame(NODE, &report));

    // First fragment arrives, flagged "more data, want another nonce".
    assert!(wait_until(Duration::from_secs(2), || {
        responder
            .send_data_payloads()
            .iter()
            .any(|app| app.get(1) == Some(&SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET))
    }));
    let first_raw = responder
        .send_data_payloads()
        .into_iter()
        .find(|app| app.get(1) == Some(&SECURITY_CMD_MESSAGE_ENCAP_NONCE_GET))
        .expect("first fragment");
    let parsed = decode_encap(&first_raw[1..]).expect("parse");
    let first = verify_and_decrypt(
        &parsed,
        &derive_encrypt_key(&KEY),
        &derive_auth_key(&KEY),
        &nonce1,
        CONTROLLER,
        NODE,
    )
    .expect("authentic");
    assert_eq!(first.part, FragmentPart::First);
    assert_eq!(first.data.len(), 28);

    // Second nonce releases the final fragment.
    let nonce2 = [0x43u8; 8];
    let mut report = vec![COMMAND_CLASS_SECURITY, SECURITY_CMD_NONCE_REPORT];
    report.extend_from_slice(&nonce2);
    handle.inject(&app_command_frame(NODE, &report));

    assert!(wait_until(Duration::from_secs(2), || {
        responder
            .send_data_payloads()
            .iter()
            .any(|app| app.get(1) == Some(&SECURITY_CMD_MESSAGE_ENCAP))
    }));
    let second_raw = responder
        .send_data_payloads()
        .into_iter()
        .find(|app| app.get(1) == Some(&SECURITY_CMD_MESSAGE_ENCAP))
        .expect("second fragment");
    let parsed = decode_encap(&second_raw[1..]).expect("parse");
    let second = verify_and_decrypt(
        &parsed,
        &derive_encrypt_key(&KEY),
        &derive_auth_key(&KEY),
        &nonce2,
        CONTROLLER,
        NODE,
    )
    .expect("authentic");
    assert_eq!(second.part, FragmentPart::Second);
    assert_eq!(second.sequence, first.sequence);

    // Reassembly restores the original payload.
    let mut reassembled = first.data.clone();
    reassembled.extend_from_slice(&second.data);
    assert_eq!(reassembled, payload);

    driver.shutdown();
}
