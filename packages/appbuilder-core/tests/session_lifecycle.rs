//! Session lifecycle: reconnect inside the grace window, cleanup after it,
//! and reset semantics.

mod common;

use std::time::Duration;

use appbuilder_core::agent::mock::{result_ok, text, tool_use, ScriptedBehavior};
use appbuilder_protocol::{ClientMessage, Envelope};
use common::*;
use serde_json::json;

fn file_writing_behavior() -> ScriptedBehavior {
    ScriptedBehavior::default()
        .with_user_script(
            "remember this",
            vec![
                tool_use(
                    "call_1",
                    "Write",
                    json!({ "file_path": "notes/memo.txt", "content": "the file you asked for" }),
                ),
                result_ok(),
            ],
        )
        .with_user_script(
            "the file you just created",
            vec![
                tool_use("call_2", "Read", json!({ "file_path": "notes/memo.txt" })),
                text("Still here."),
                result_ok(),
            ],
        )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_within_grace_reuses_the_session() {
    let app = TestApp::new(file_writing_behavior());
    let mut rx = app.connect("sess-reconnect", false).await;
    next_envelope(&mut rx).await;

    app.chat("sess-reconnect", "remember this for me").await;
    let first = collect_turn(&mut rx).await;
    assert!(matches!(first.last().unwrap(), Envelope::Done { .. }));

    // Client goes away; teardown is scheduled, not immediate.
    app.manager.disconnect("sess-reconnect", true).await;
    assert_eq!(app.manager.session_count().await, 1);

    // Reconnect inside the grace window cancels the teardown and reuses the
    // agent; the workspace was never recreated.
    let mut rx = app.connect("sess-reconnect", true).await;
    match next_envelope(&mut rx).await {
        Envelope::Connection { reconnected, .. } => assert!(reconnected),
        other => panic!("expected connection envelope, got {other:?}"),
    }

    app.chat("sess-reconnect", "show the file you just created").await;
    let second = collect_turn(&mut rx).await;
    let results = tool_results(&second);
    assert!(!results[0].1);
    assert_eq!(
        results[0].0["output"].as_str().unwrap(),
        "the file you asked for"
    );

    // Well past the original grace window the session is still alive.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(app.manager.session_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grace_expiry_cleans_the_session_up_exactly_once() {
    let app = TestApp::new(file_writing_behavior());
    let mut rx = app.connect("sess-expire", false).await;
    next_envelope(&mut rx).await;

    app.chat("sess-expire", "remember this for me").await;
    collect_turn(&mut rx).await;

    app.manager.disconnect("sess-expire", true).await;
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(app.manager.session_count().await, 0);
    // Workspace directories are retained for post-mortem inspection.
    assert!(app.workspace("sess-expire").join("notes/memo.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abrupt_disconnect_tears_down_immediately() {
    let app = TestApp::new(ScriptedBehavior::default());
    let mut rx = app.connect("sess-abrupt", false).await;
    next_envelope(&mut rx).await;

    app.manager.disconnect("sess-abrupt", false).await;
    assert_eq!(app.manager.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_rebuilds_workspace_and_state() {
    let app = TestApp::new(file_writing_behavior());
    let mut rx = app.connect("sess-reset", false).await;
    next_envelope(&mut rx).await;

    app.chat("sess-reset", "remember this for me").await;
    collect_turn(&mut rx).await;
    assert!(app.workspace("sess-reset").join("notes/memo.txt").exists());

    app.manager
        .receive("sess-reset", ClientMessage::Reset)
        .await
        .unwrap();
    match next_envelope(&mut rx).await {
        Envelope::Connection { session_id, .. } => assert_eq!(session_id, "sess-reset"),
        other => panic!("expected connection after reset, got {other:?}"),
    }

    // The old file is gone and the fresh scaffold is back.
    assert!(!app.workspace("sess-reset").join("notes/memo.txt").exists());
    assert!(app.workspace("sess-reset").join("package.json").exists());

    // The session still takes turns after the reset.
    app.chat("sess-reset", "hello").await;
    let envelopes = collect_turn(&mut rx).await;
    assert!(matches!(envelopes.last().unwrap(), Envelope::Done { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_is_rejected_mid_turn() {
    let behavior = ScriptedBehavior::default().with_user_script(
        "slow",
        vec![
            tool_use("call_1", "Bash", json!({ "command": "sleep 2" })),
            result_ok(),
        ],
    );
    let app = TestApp::new(behavior);
    let mut rx = app.connect("sess-reset-busy", false).await;
    next_envelope(&mut rx).await;

    let chat = app.manager.receive(
        "sess-reset-busy",
        ClientMessage::Chat {
            message: "slow".to_string(),
        },
    );
    let reset = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        app.manager
            .receive("sess-reset-busy", ClientMessage::Reset)
            .await
    };
    let (chat, reset) = tokio::join!(chat, reset);
    chat.unwrap();
    reset.unwrap();

    let mut saw_rejection = false;
    let mut saw_done = false;
    loop {
        let envelope = next_envelope(&mut rx).await;
        match &envelope {
            Envelope::Error { message } if message.contains("reset") => saw_rejection = true,
            Envelope::Done { .. } => saw_done = true,
            _ => {}
        }
        if saw_rejection && saw_done {
            break;
        }
    }
}
