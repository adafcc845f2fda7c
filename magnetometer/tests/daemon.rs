//! Process-level behaviour of the daemon binary.

use std::net::TcpListener;
use std::process::Command;

#[test]
fn test_unreachable_broker_exits_with_one_error_line() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = Command::new(env!("CARGO_BIN_EXE_magnetometer"))
        .args(["--backend", "sim", "--broker-host", "127.0.0.1"])
        .args(["--broker-port", &port.to_string()])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        stderr.matches("Unable to connect to MQTT broker").count(),
        1,
        "{stderr}"
    );
    assert!(output.stdout.is_empty());
}
