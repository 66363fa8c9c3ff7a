//! Generate JSON test vectors for browser client interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;

fn main() {
    print_test_vector(
        "input_interactive",
        &ClientMessage::Input(InputData {
            data: "ls\r".to_string(),
            source: InputSource::Interactive,
        })
        .to_json(),
    );

    print_test_vector(
        "input_automation",
        &ClientMessage::Input(InputData {
            data: "echo hi".to_string(),
            source: InputSource::Automation,
        })
        .to_json(),
    );

    print_test_vector(
        "connected",
        &ServerMessage::Connected(Connected {
            connection_id: "4f1c2a9e-8d7b-4e3f-9a1b-2c3d4e5f6a7b".to_string(),
            mode: "dedicated".to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .to_json(),
    );

    print_test_vector(
        "exited",
        &ServerMessage::Exited(Exited { exit_code: Some(0) }).to_json(),
    );

    print_test_vector(
        "error",
        &ServerMessage::error(ErrorCode::TerminalUnavailable, "failed to spawn PTY").to_json(),
    );

    print_test_vector(
        "inject_request",
        &serde_json::to_string(&InjectRequest::new("c1", "echo hi"))
            .map_err(protocol::ProtocolError::from),
    );
}

fn print_test_vector(name: &str, json: &protocol::Result<String>) {
    match json {
        Ok(json) => println!("export const {} = {};", name, json),
        Err(e) => eprintln!("// {}: {}", name, e),
    }
}
