#![cfg(unix)]

use quill_mcp::{ConnectionState, McpClient, McpError, McpTimeouts};
use quill_testkit::{
    codeless_error_script, echo_provider_script, failing_handshake_script, provider_config, reversing_provider_script,
    silent_provider_script,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fast_timeouts() -> McpTimeouts {
    McpTimeouts {
        handshake: Duration::from_secs(5),
        discovery: Duration::from_secs(5),
        call: Duration::from_secs(10),
        resource: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
    }
}

#[test]
fn handshake_discovers_tools_and_resources() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    client.register("alpha", provider_config(echo_provider_script(), "alpha"));

    let count = client.connect("alpha").expect("connect");
    assert_eq!(count, 2);
    assert_eq!(client.state("alpha"), Some(ConnectionState::Ready));

    let names: Vec<String> = client
        .tool_definitions()
        .into_iter()
        .map(|def| def.function.name)
        .collect();
    assert_eq!(names, vec!["mcp__alpha__echo", "mcp__alpha__fail"]);
    assert_eq!(
        client.resolve_api_name("mcp__alpha__echo"),
        Some(("alpha".to_string(), "echo".to_string()))
    );

    let resources: Vec<&str> = client.resources().map(|r| r.uri.as_str()).collect();
    assert_eq!(resources, vec!["mem://alpha/readme"]);
    let contents = client
        .read_resource("mem://alpha/readme")
        .expect("read")
        .expect("known resource");
    assert_eq!(contents[0]["text"], "hello from alpha");
}

#[test]
fn tool_calls_route_to_the_provider() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    client.register("alpha", provider_config(echo_provider_script(), "alpha"));
    client.connect("alpha").expect("connect");

    let out = client
        .call_api_tool("mcp__alpha__echo", &json!({"text": "hi there"}))
        .expect("call");
    assert_eq!(out, "echo: hi there");

    match client.call_tool("alpha", "fail", &json!({})) {
        Err(McpError::ToolFailed(text)) => assert_eq!(text, "fail tool refused"),
        other => panic!("expected ToolFailed, got {other:?}"),
    }
    assert!(matches!(
        client.call_api_tool("mcp__alpha__missing", &json!({})),
        Err(McpError::UnknownTool(_))
    ));
}

#[test]
fn concurrent_calls_receive_their_own_responses() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    client.register("rev", provider_config(reversing_provider_script(), "rev"));
    client.connect("rev").expect("connect");
    let shared = client.into_shared();

    let first = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let client = shared.read().expect("read lock");
            client.call_tool("rev", "echo", &json!({"text": "first"}))
        })
    };
    // Let the first request reach the provider before the second is sent.
    thread::sleep(Duration::from_millis(200));
    let second = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let client = shared.read().expect("read lock");
            client.call_tool("rev", "echo", &json!({"text": "second"}))
        })
    };

    assert_eq!(second.join().expect("join").expect("call"), "echo: second");
    assert_eq!(first.join().expect("join").expect("call"), "echo: first");
}

#[test]
fn silent_provider_times_out_during_handshake() {
    let mut client = McpClient::with_timeouts(McpTimeouts {
        handshake: Duration::from_millis(300),
        ..fast_timeouts()
    });
    client.register("mute", provider_config(silent_provider_script(), "mute"));

    let err = client.connect("mute").expect_err("handshake should time out");
    assert!(matches!(err, McpError::Timeout { ref method, .. } if method == "initialize"));
    assert_eq!(client.state("mute"), Some(ConnectionState::Disconnected));
    assert_eq!(client.tools().count(), 0);
    assert!(client.last_error("mute").is_some_and(|e| e.contains("initialize")));
}

#[test]
fn rpc_error_during_handshake_disconnects() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    client.register("bad", provider_config(failing_handshake_script(), "bad"));

    match client.connect("bad") {
        Err(McpError::Rpc { code, message }) => {
            assert_eq!(code, -32603);
            assert_eq!(message, "boom");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
    assert_eq!(client.state("bad"), Some(ConnectionState::Disconnected));
}

#[test]
fn codeless_error_reply_fails_without_waiting() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    client.register("loose", provider_config(codeless_error_script(), "loose"));

    let started = Instant::now();
    match client.connect("loose") {
        Err(McpError::Rpc { code, message }) => {
            assert_eq!(code, 0);
            assert_eq!(message, "no code here");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.state("loose"), Some(ConnectionState::Disconnected));
}

#[test]
fn colliding_api_names_keep_the_first_server() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    let servers = [
        ("a.b".to_string(), provider_config(echo_provider_script(), "dotted")),
        ("a_b".to_string(), provider_config(echo_provider_script(), "underscored")),
    ]
    .into_iter()
    .collect();
    let outcomes = client.connect_all(&servers);
    let counts: Vec<(&str, usize)> = outcomes
        .iter()
        .map(|(name, result)| (name.as_str(), *result.as_ref().expect("connect")))
        .collect();
    assert_eq!(counts, vec![("a.b", 2), ("a_b", 0)]);

    assert_eq!(client.tools().count(), 2);
    assert_eq!(client.shadowed_tools("a_b").len(), 2);
    assert!(client.shadowed_tools("a_b")[0].contains("already provided by a.b/"));
    assert!(client.shadowed_tools("a.b").is_empty());
    assert_eq!(
        client.resolve_api_name("mcp__a_b__echo"),
        Some(("a.b".to_string(), "echo".to_string()))
    );

    client.disconnect("a.b");
    assert_eq!(client.connect("a_b").expect("reconnect"), 2);
    assert!(client.shadowed_tools("a_b").is_empty());
    client.disconnect_all();
}

#[test]
fn disconnecting_one_server_keeps_the_others() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    let servers = [
        ("alpha".to_string(), provider_config(echo_provider_script(), "alpha")),
        ("beta".to_string(), provider_config(echo_provider_script(), "beta")),
    ]
    .into_iter()
    .collect();
    let outcomes = client.connect_all(&servers);
    assert!(outcomes.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(client.tools().count(), 4);

    assert!(client.disconnect("alpha"));
    assert_eq!(client.state("alpha"), Some(ConnectionState::Disconnected));
    assert!(client.tools().all(|tool| tool.server == "beta"));
    assert_eq!(client.resolve_api_name("mcp__alpha__echo"), None);
    assert_eq!(client.read_resource("mem://alpha/readme").expect("lookup"), None);
    assert!(matches!(
        client.call_tool("alpha", "echo", &json!({"text": "x"})),
        Err(McpError::NotConnected(_))
    ));
    assert_eq!(
        client
            .call_api_tool("mcp__beta__echo", &json!({"text": "still here"}))
            .expect("beta call"),
        "echo: still here"
    );

    client.disconnect_all();
    client.disconnect_all();
    assert_eq!(client.tools().count(), 0);
    assert_eq!(client.state("beta"), Some(ConnectionState::Disconnected));
}

#[test]
fn disabled_servers_are_skipped() {
    let mut client = McpClient::with_timeouts(fast_timeouts());
    let mut config = provider_config(echo_provider_script(), "off");
    config.enabled = false;
    let servers = [("off".to_string(), config)].into_iter().collect();
    assert!(client.connect_all(&servers).is_empty());
    assert_eq!(client.state("off"), None);
}
