//! Connects to a real ELM327 adapter over a serial/virtual-COM port, reads
//! a handful of PIDs and the stored DTCs, then exits.
//!
//! Run with `cargo run --example elm327_serial --features serial -- /dev/rfcomm0`.

use obd2_client::client::ObdClient;
use obd2_client::session::SessionOptions;
use obd2_client::transport::SerialTransport;

fn main() {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let path = std::env::args()
        .nth(1)
        .expect("usage: elm327_serial <serial-port-path>");

    let transport = SerialTransport::open(&path, 38_400).expect("failed to open serial port");
    let mut client = ObdClient::new(Box::new(transport), SessionOptions::default());

    let info = client.initialize().expect("adapter did not reach Ready");
    println!(
        "connected to {} (protocol {:?}, battery {:?}V)",
        info.version, info.protocol, info.battery_voltage
    );

    match client.read_pids(&[0x0C, 0x0D, 0x05]) {
        Ok(samples) => {
            for sample in samples {
                println!(
                    "{}: {:.1} {} ({:?})",
                    sample.definition.name, sample.value, sample.definition.unit, sample.status
                );
            }
        }
        Err(e) => println!("PID read failed: {e}"),
    }

    match client.read_stored_dtcs() {
        Ok(dtcs) if dtcs.is_empty() => println!("no stored DTCs"),
        Ok(dtcs) => {
            for dtc in dtcs {
                println!("stored DTC: {}", dtc.code);
            }
        }
        Err(e) => println!("DTC read failed: {e}"),
    }

    client.close();
}
