//! End-to-end scenarios (spec §8 "Concrete end-to-end scenarios") driving a
//! real spawned `capsule-worker` subprocess through the public
//! [`capsule_core::session::Session`] API.

use std::time::Duration;

use capsule_core::config::Config;
use capsule_core::message::{ErrorKind, Stream};
use capsule_core::session::{ExecuteEvent, Session, WorkerCommand};

fn test_session() -> Session {
    let program = env!("CARGO_BIN_EXE_capsule-worker").to_string();
    Session::new(Config::default(), WorkerCommand::new(program))
}

async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<ExecuteEvent>) -> (Vec<(Stream, String)>, Option<ExecuteEvent>) {
    let mut outputs = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(ExecuteEvent::Output { stream, data, .. })) => outputs.push((stream, data)),
            Ok(Some(ExecuteEvent::Input { prompt, .. })) => {
                panic!("unexpected input request (prompt={prompt:?}) in a non-interactive scenario")
            }
            Ok(Some(terminal @ ExecuteEvent::Result { .. })) => return (outputs, Some(terminal)),
            Ok(Some(terminal @ ExecuteEvent::Error { .. })) => return (outputs, Some(terminal)),
            Ok(None) => return (outputs, None),
            Err(_) => panic!("timed out waiting for terminal execution event"),
        }
    }
}

#[tokio::test]
async fn scenario_a_plain_sync() {
    let session = test_session();
    session.start().await.expect("session start");

    let (_, rx) = session.execute("x = 2 + 3".into(), false, None).await.unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::Value::Null),
        other => panic!("expected a statement result, got {other:?}"),
    }

    let (_, rx) = session.execute("x * 2".into(), false, None).await.unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!(10)),
        other => panic!("expected value 10, got {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_b_top_level_await() {
    let session = test_session();
    session.start().await.expect("session start");

    let (_, rx) = session
        .execute(
            "import asyncio\nresult = await asyncio.sleep(0, 'ok')".into(),
            false,
            None,
        )
        .await
        .unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!("ok")),
        other => panic!("expected 'ok', got {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_c_input_round_trip() {
    let session = test_session();
    session.start().await.expect("session start");

    let (execution_id, mut rx) = session
        .execute("name = input('who?')\nname.upper()".into(), false, None)
        .await
        .unwrap();

    let input_id = match tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an input request")
        .expect("execution stream closed before an input request arrived")
    {
        ExecuteEvent::Input { input_id, prompt } => {
            assert_eq!(prompt, "who?");
            input_id
        }
        other => panic!("expected an input request, got {other:?}"),
    };

    session.input_response(input_id, "ada".into()).await.unwrap();

    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!("ADA")),
        other => panic!("expected 'ADA', got {other:?}"),
    }

    session.forget_execution(&execution_id);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_d_syntax_error_does_not_poison_the_session() {
    let session = test_session();
    session.start().await.expect("session start");

    let (_, rx) = session.execute("def (".into(), false, None).await.unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Compilation),
        other => panic!("expected compilation error, got {other:?}"),
    }

    let (_, rx) = session.execute("1 + 1".into(), false, None).await.unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!(2)),
        other => panic!("expected 2, got {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_e_execute_timeout_cancels_and_yields_a_cancelled_error() {
    let session = test_session();
    session.start().await.expect("session start");

    let (_, rx) = session
        .execute(
            "import asyncio\nawait asyncio.sleep(5)".into(),
            false,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Cancelled),
        other => panic!("expected a cancelled error, got {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_g_print_output_precedes_the_terminal_result() {
    let session = test_session();
    session.start().await.expect("session start");

    let (_, rx) = session
        .execute("print('hello')\n1 + 1".into(), false, None)
        .await
        .unwrap();
    let (outputs, terminal) = drain(rx).await;

    assert_eq!(outputs, vec![(Stream::Stdout, "hello\n".to_string())]);
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!(2)),
        other => panic!("expected 2, got {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_f_blocking_offload_does_not_block_heartbeats() {
    let program = env!("CARGO_BIN_EXE_capsule-worker").to_string();
    let config = Config {
        heartbeat_interval_s: 0.05,
        ..Config::default()
    };
    let session = Session::new(config, WorkerCommand::new(program));
    session.start().await.expect("session start");

    let heartbeat_seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = heartbeat_seen.clone();
    session
        .add_message_interceptor(move |envelope| {
            if matches!(envelope.body, capsule_core::message::Body::Heartbeat) {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .await;

    let (_, rx) = session
        .execute("import time\ntime.sleep(0.2)\n'done'".into(), false, None)
        .await
        .unwrap();
    let (_, terminal) = drain(rx).await;
    match terminal {
        Some(ExecuteEvent::Result { value, .. }) => assert_eq!(value, serde_json::json!("done")),
        other => panic!("expected 'done', got {other:?}"),
    }
    assert!(
        heartbeat_seen.load(std::sync::atomic::Ordering::SeqCst),
        "expected a heartbeat to be observed while blocking-sync code ran"
    );

    session.shutdown().await.unwrap();
}
