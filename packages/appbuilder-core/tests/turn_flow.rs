//! Happy-path turn streaming: envelope ordering, tool execution, preview URL
//! derivation, turn serialization, and the turn timeout.

mod common;

use std::time::Duration;

use appbuilder_core::agent::mock::{result_ok, text, tool_use, ScriptedBehavior};
use appbuilder_protocol::{ClientMessage, Envelope};
use common::*;
use serde_json::json;

const PAGE_SOURCE: &str = "export default function Page() { return <h1>Hello</h1> }";

fn happy_behavior() -> ScriptedBehavior {
    ScriptedBehavior::default()
        .with_user_script(
            "Create a page",
            vec![
                text("Creating the page now."),
                tool_use(
                    "call_1",
                    "Write",
                    json!({ "file_path": "app/page.tsx", "content": PAGE_SOURCE }),
                ),
                result_ok(),
            ],
        )
        .with_user_script(
            "start the preview",
            vec![
                tool_use("call_2", "mark-security-review-passed", json!({})),
                tool_use("call_3", "start-dev-server", json!({ "port": 3000 })),
                result_ok(),
            ],
        )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_turn_streams_text_write_and_done() {
    let app = TestApp::new(happy_behavior());
    let mut rx = app.connect("sess-happy", false).await;

    // The connection envelope precedes every turn envelope on the channel.
    let first = next_envelope(&mut rx).await;
    assert!(matches!(
        first,
        Envelope::Connection { ref session_id, reconnected: false } if session_id == "sess-happy"
    ));

    app.chat("sess-happy", "Create a page that says Hello").await;
    let envelopes = collect_turn(&mut rx).await;

    assert!(matches!(envelopes[0], Envelope::Text { .. }));
    let uses = tool_uses(&envelopes);
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].0, "Write");
    assert!(uses[0].1["file_path"]
        .as_str()
        .unwrap()
        .ends_with("page.tsx"));

    let results = tool_results(&envelopes);
    assert_eq!(results.len(), 1);
    assert!(!results[0].1, "write result must not be an error");

    // The write landed inside the session workspace.
    let written = app.workspace("sess-happy").join("app/page.tsx");
    assert_eq!(std::fs::read_to_string(written).unwrap(), PAGE_SOURCE);

    // Done carries the preview URL derived from the allocated port.
    let url = done_preview_url(&envelopes).expect("done carries preview url");
    let port = port_of(&url);
    assert!(port >= 3001, "allocated port stays above user services");
    assert_ne!(port, 3000);

    match envelopes.last().unwrap() {
        Envelope::Done {
            cost_usd,
            duration_ms,
            num_turns,
            ..
        } => {
            assert!(cost_usd.is_some());
            assert!(duration_ms.is_some());
            assert!(num_turns.is_some());
        }
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dev_server_turn_substitutes_the_allocated_port() {
    let app = TestApp::new(happy_behavior());
    let mut rx = app.connect("sess-preview", false).await;
    next_envelope(&mut rx).await;

    app.chat("sess-preview", "Create a page that says Hello").await;
    let first_turn = collect_turn(&mut rx).await;
    let allocated = port_of(&done_preview_url(&first_turn).unwrap());

    // Answer the readiness probe on the allocated port; the dev-server child
    // itself is a placeholder process.
    let server = serve_http_ok(allocated).await;

    app.chat("sess-preview", "start the preview").await;
    let envelopes = collect_turn(&mut rx).await;
    server.abort();

    let uses = tool_uses(&envelopes);
    assert_eq!(uses[0].0, "mark-security-review-passed");
    assert_eq!(uses[1].0, "start-dev-server");
    // The model asked for port 3000 and the supervisor ignored it.
    assert_eq!(uses[1].1["port"], 3000);

    let results = tool_results(&envelopes);
    assert!(results.iter().all(|(_, is_error)| !is_error));
    let server_result = results[1].0;
    assert_eq!(port_of(server_result["url"].as_str().unwrap()), allocated);

    let url = done_preview_url(&envelopes).unwrap();
    assert_eq!(port_of(&url), allocated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_chat_is_rejected_without_side_effects() {
    let behavior = ScriptedBehavior::default().with_user_script(
        "slow",
        vec![
            tool_use("call_1", "Bash", json!({ "command": "sleep 2" })),
            text("finished"),
            result_ok(),
        ],
    );
    let app = TestApp::new(behavior);
    let mut rx = app.connect("sess-busy", false).await;
    next_envelope(&mut rx).await;

    let first = app.manager.receive(
        "sess-busy",
        ClientMessage::Chat {
            message: "slow".to_string(),
        },
    );
    let second = app.manager.receive(
        "sess-busy",
        ClientMessage::Chat {
            message: "slow again".to_string(),
        },
    );
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    let mut envelopes = Vec::new();
    // One busy error plus one full stream ending in done.
    loop {
        let envelope = next_envelope(&mut rx).await;
        let done = matches!(envelope, Envelope::Done { .. });
        envelopes.push(envelope);
        if done {
            break;
        }
    }
    let busy: Vec<_> = envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(busy.len(), 1, "exactly one rejection: {envelopes:?}");
    assert!(busy[0].contains("wait"));
    let done_count = envelopes
        .iter()
        .filter(|envelope| matches!(envelope, Envelope::Done { .. }))
        .count();
    assert_eq!(done_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn turn_timeout_releases_the_session() {
    let behavior = ScriptedBehavior::default().with_user_script(
        "hang",
        vec![
            tool_use("call_1", "Bash", json!({ "command": "sleep 30" })),
            result_ok(),
        ],
    );
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.turn_timeout = Duration::from_millis(500);
    let app = TestApp::with_config(config, behavior, root);

    let mut rx = app.connect("sess-timeout", false).await;
    next_envelope(&mut rx).await;

    app.chat("sess-timeout", "hang").await;
    let envelopes = collect_turn(&mut rx).await;
    match envelopes.last().unwrap() {
        Envelope::Error { message } => assert!(message.contains("timed out")),
        other => panic!("expected timeout error, got {other:?}"),
    }

    // The lock is released; the next (unscripted) turn echoes and completes.
    app.chat("sess-timeout", "hello again").await;
    let envelopes = collect_turn(&mut rx).await;
    assert!(matches!(envelopes.last().unwrap(), Envelope::Done { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_answers_pong_and_empty_chat_errors() {
    let app = TestApp::new(ScriptedBehavior::default());
    let mut rx = app.connect("sess-ping", false).await;
    next_envelope(&mut rx).await;

    app.manager
        .receive("sess-ping", ClientMessage::Ping)
        .await
        .unwrap();
    assert!(matches!(next_envelope(&mut rx).await, Envelope::Pong));

    app.chat("sess-ping", "").await;
    match next_envelope(&mut rx).await {
        Envelope::Error { message } => assert!(message.contains("empty")),
        other => panic!("expected error, got {other:?}"),
    }
}
