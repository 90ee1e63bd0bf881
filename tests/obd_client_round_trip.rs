//! End-to-end round trip through the public API: initialize a client over a
//! [`SimulatedTransport`], issue a batched 3-PID read, and confirm the
//! samples come back decoded and in request order.
//!
//! Grounded on the teacher's `tests/uds_sim_ecu.rs` style (a simulated
//! channel driven by a callback, exercised through the real diagnostic
//! server rather than by calling module internals directly).

use obd2_client::client::ObdClient;
use obd2_client::session::SessionOptions;
use obd2_client::transport::SimulatedTransport;
use obd2_client::DiagError;

fn ready_transport() -> SimulatedTransport {
    let t = SimulatedTransport::new();
    t.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
    t.add_response(b"ATE0\r", b"OK\r>");
    t.add_response(b"ATL0\r", b"OK\r>");
    t.add_response(b"ATS0\r", b"OK\r>");
    t.add_response(b"ATH1\r", b"OK\r>");
    t.add_response(b"ATAT1\r", b"OK\r>");
    t.add_response(b"ATSP0\r", b"OK\r>");
    t.add_response(b"0100\r", b"41 00 BE 1F A8 13\r>");
    t.add_response(b"ATDPN\r", b"6\r>");
    t.add_response(b"ATRV\r", b"12.6V\r>");
    t
}

#[test]
fn batched_read_of_three_pids_decodes_in_request_order() {
    let t = ready_transport();
    // RPM ($0C, 2 bytes), speed ($0D, 1 byte), throttle ($11, 1 byte):
    // SID $41 + 0C 1A F8 + 0D 32 + 11 7F = 8 data bytes, one ISO-TP
    // single frame (PCI `08`).
    t.add_response(b"010C0D11\r", b"7E8 08 41 0C 1A F8 0D 32 11 7F\r>");

    let mut client = ObdClient::new(Box::new(t), SessionOptions::default());
    client.initialize().unwrap();

    let samples = client.read_pids(&[0x0C, 0x0D, 0x11]).unwrap();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].definition.pid, 0x0C);
    assert!((samples[0].value - 1726.0).abs() < 1e-6);
    assert_eq!(samples[1].definition.pid, 0x0D);
    assert!((samples[1].value - 50.0).abs() < 1e-6);
    assert_eq!(samples[2].definition.pid, 0x11);
    assert!((samples[2].value - (0x7F as f64 * 100.0 / 255.0)).abs() < 1e-6);
}

#[test]
fn uninitialized_client_rejects_requests() {
    let t = ready_transport();
    let client = ObdClient::new(Box::new(t), SessionOptions::default());
    // `initialize()` was never called, so the worker thread never started.
    assert!(matches!(
        client.read_pid(0x01, 0x0C),
        Err(DiagError::ConnectionClosed)
    ));
}

#[test]
fn connection_loss_mid_session_fails_pending_and_future_calls() {
    let t = ready_transport();
    let t_handle = t.clone();
    let mut client = ObdClient::new(Box::new(t), SessionOptions::default());
    client.initialize().unwrap();

    t_handle.break_connection();

    // The worker loop notices on its next pass through the queue and
    // shuts itself down; give it a moment, then confirm new calls are
    // rejected with the same fatal error every pending command resolves
    // with (spec §5, §7).
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(matches!(
        client.read_pid(0x01, 0x0C),
        Err(DiagError::ConnectionClosed)
    ));
}
