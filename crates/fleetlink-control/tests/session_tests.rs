//! End-to-end session tests against a scripted agent peer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

use fleetlink_control::{
    DownloadResult, ExecResult, ListFilesResult, ProgressFn, RegistryConfig, SessionRegistry,
    ShellEvent, TransferErrorKind,
};
use fleetlink_proto::FrameStream;

const WAIT: Duration = Duration::from_secs(5);

/// Registry bound to an ephemeral port with a short registration window so
/// unregistered tests do not stall on the handshake.
async fn start_registry() -> SessionRegistry {
    let registry = SessionRegistry::new(RegistryConfig {
        registration_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    registry.start(0).await.expect("bind ephemeral port");
    registry
}

async fn connect_agent(registry: &SessionRegistry) -> FrameStream<TcpStream> {
    let port = registry.local_port().expect("registry is listening");
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to registry");
    FrameStream::new(stream)
}

async fn next_clients(rx: &mut broadcast::Receiver<Vec<String>>) -> Vec<String> {
    timeout(WAIT, rx.recv())
        .await
        .expect("client set change")
        .expect("client stream open")
}

/// Subscribe, connect one scripted agent, and return its session id.
async fn admit_agent(
    registry: &SessionRegistry,
    rx: &mut broadcast::Receiver<Vec<String>>,
) -> (FrameStream<TcpStream>, String) {
    let agent = connect_agent(registry).await;
    let ids = next_clients(rx).await;
    assert_eq!(ids.len(), 1);
    (agent, ids[0].clone())
}

fn collecting_progress() -> (ProgressFn, Arc<Mutex<Vec<(u64, u64)>>>) {
    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |done, total| {
        sink.lock().unwrap().push((done, total));
    });
    (progress, seen)
}

#[tokio::test]
async fn registration_populates_identity() {
    // Registration window long enough for the register frame to land inside.
    let registry = SessionRegistry::new(RegistryConfig {
        registration_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    registry.start(0).await.expect("bind ephemeral port");
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    agent
        .write_json(&json!({
            "type": "register",
            "device_name": "lab-7",
            "device_id": "dev-7",
            "arch": "aarch64",
        }))
        .await
        .unwrap();

    let session = registry.get(&id).unwrap();
    let mut info = None;
    for _ in 0..50 {
        info = session.registration_info();
        if info.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let info = info.expect("registration processed");
    assert_eq!(info.device_name, "lab-7");
    assert_eq!(info.device_id, "dev-7");
    assert_eq!(info.arch, "aarch64");

    registry.stop().await;
}

#[tokio::test]
async fn unregistered_session_stays_usable() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let request = agent.read_json().await.unwrap();
        assert_eq!(request.msg_type(), "exec");
        assert_eq!(request.str_field("cmd"), Some("echo hi"));
        agent
            .write_json(&json!({"type": "exec", "output": "hi\n"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    assert!(session.registration_info().is_none());
    let result = session.run_command("echo hi", WAIT).await;
    assert_eq!(result, ExecResult::Output("hi\n".to_string()));

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn exec_reports_agent_errors_and_mismatches() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "exec", "error": "sh: not found"}))
            .await
            .unwrap();
        let _ = agent.read_json().await.unwrap();
        // Wrong reply type; the operation fails but the session survives.
        agent
            .write_json(&json!({"type": "file", "items": []}))
            .await
            .unwrap();
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "exec", "output": "ok"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    assert_eq!(
        session.run_command("x", WAIT).await,
        ExecResult::Failed("sh: not found".to_string())
    );
    assert_eq!(
        session.run_command("y", WAIT).await,
        ExecResult::Failed("Invalid response from client".to_string())
    );
    assert_eq!(
        session.run_command("z", WAIT).await,
        ExecResult::Output("ok".to_string())
    );

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn list_files_parses_entries_and_errors() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let request = agent.read_json().await.unwrap();
        assert_eq!(request.msg_type(), "file");
        agent
            .write_json(&json!({"type": "file", "items": [
                {"path": "/etc", "type": "path"},
                {"path": "/etc/hosts", "type": "file"},
            ]}))
            .await
            .unwrap();
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "file", "error": "permission denied"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    match session.list_files("/etc", WAIT).await {
        ListFilesResult::Listed(entries) => {
            assert_eq!(entries.len(), 2);
            assert!(!entries[0].is_file);
            assert!(entries[1].is_file);
        }
        other => panic!("unexpected listing result: {other:?}"),
    }
    assert_eq!(
        session.list_files("/root", WAIT).await,
        ListFilesResult::Error("permission denied".to_string())
    );

    // Invalid paths fail without touching the wire.
    assert_eq!(
        session.list_files("relative", WAIT).await,
        ListFilesResult::Failed
    );

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn upload_streams_file_and_reports_progress() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let total: u64 = 10 * 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("payload.bin");
    std::fs::write(&local, vec![0xabu8; total as usize]).unwrap();

    let peer = tokio::spawn(async move {
        let request = agent.read_json().await.unwrap();
        assert_eq!(request.msg_type(), "uploadfile");
        assert_eq!(request.str_field("path"), Some("/data/payload.bin"));

        let mut sink = tokio::io::sink();
        let received = agent.read_binary_into(&mut sink, |_, _| {}).await.unwrap();
        agent
            .write_json(&json!({"type": "uploadfile", "error": ""}))
            .await
            .unwrap();
        received
    });

    let (progress, seen) = collecting_progress();
    let session = registry.get(&id).unwrap();
    let uploaded = session
        .upload_file(&local, "/data/payload.bin", Some(progress), WAIT)
        .await;
    assert!(uploaded);

    let received = peer.await.unwrap();
    assert_eq!(received, total);

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(seen.last(), Some(&(total, total)));

    registry.stop().await;
}

#[tokio::test]
async fn upload_rejects_agent_error() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("small.bin");
    std::fs::write(&local, b"payload").unwrap();

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        let mut sink = tokio::io::sink();
        let _ = agent.read_binary_into(&mut sink, |_, _| {}).await.unwrap();
        agent
            .write_json(&json!({"type": "uploadfile", "error": "disk full"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    assert!(!session.upload_file(&local, "/data/x", None, WAIT).await);

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn download_writes_file_with_progress() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let peer = tokio::spawn(async move {
        let request = agent.read_json().await.unwrap();
        assert_eq!(request.msg_type(), "downloadfile");
        agent
            .write_json(&json!({"type": "downloadfile", "error": ""}))
            .await
            .unwrap();
        let total = payload.len() as u64;
        let mut cursor = std::io::Cursor::new(payload);
        agent
            .write_binary_from(&mut cursor, total, |_, _| {})
            .await
            .unwrap();
        agent
    });

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("fetched.bin");
    let (progress, seen) = collecting_progress();

    let session = registry.get(&id).unwrap();
    let result = session
        .download_file("/data/fetched.bin", &local, Some(progress), WAIT)
        .await;
    assert_eq!(result, DownloadResult::Done);
    assert_eq!(std::fs::read(&local).unwrap(), expected);

    let seen = seen.lock().unwrap();
    let total = expected.len() as u64;
    assert_eq!(seen.last(), Some(&(total, total)));

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn download_missing_file_is_not_found() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "downloadfile", "error": "file not found"}))
            .await
            .unwrap();
        agent
    });

    let dir = tempfile::tempdir().unwrap();
    let session = registry.get(&id).unwrap();
    let result = session
        .download_file("/nonexistent", &dir.path().join("out"), None, WAIT)
        .await;
    assert_eq!(result, DownloadResult::NotFound);

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn device_info_passes_through_and_synthesizes_on_mismatch() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "info", "model": "rk3588", "uptime": 12345}))
            .await
            .unwrap();
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "exec", "output": "nope"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    let info = session.request_device_info(WAIT).await;
    assert_eq!(info["model"], "rk3588");
    assert_eq!(info["uptime"], 12345);

    let synthesized = session.request_device_info(WAIT).await;
    assert_eq!(synthesized["type"], "info");
    assert_eq!(synthesized["error"], "Invalid response from client");

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn concurrent_callers_never_interleave_exchanges() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    const CALLS: usize = 9;

    // The peer reads strictly alternating request/response exchanges and
    // echoes each command back. Interleaved requests would corrupt its
    // framing or cross replies between callers.
    let peer = tokio::spawn(async move {
        for _ in 0..CALLS {
            let request = agent.read_json().await.unwrap();
            assert_eq!(request.msg_type(), "exec");
            let cmd = request.str_field("cmd").unwrap().to_string();
            agent
                .write_json(&json!({"type": "exec", "output": cmd}))
                .await
                .unwrap();
        }
        agent
    });

    let session = registry.get(&id).unwrap();
    let mut callers = Vec::new();
    for caller in 0..3 {
        let session = session.clone();
        callers.push(tokio::spawn(async move {
            for call in 0..CALLS / 3 {
                let cmd = format!("caller-{caller}-call-{call}");
                let result = session.run_command(&cmd, WAIT).await;
                assert_eq!(result, ExecResult::Output(cmd));
            }
        }));
    }
    for caller in callers {
        caller.await.unwrap();
    }

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn close_is_idempotent_with_one_removal() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (_agent, id) = admit_agent(&registry, &mut clients).await;

    let session = registry.get(&id).unwrap();
    session.close().await;
    session.close().await;
    session.close().await;

    let ids = next_clients(&mut clients).await;
    assert!(ids.is_empty());
    assert!(registry.get(&id).is_none());

    // No further removal events for the extra closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        clients.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    registry.stop().await;
}

#[tokio::test]
async fn reply_timeout_fails_the_call_and_closes_the_session() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        // Read the request and never answer.
        let _ = agent.read_json().await.unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    let result = session
        .run_command("sleep forever", Duration::from_millis(200))
        .await;
    assert_eq!(result, ExecResult::TimedOut);

    // A late reply could desynchronize the next exchange, so the session
    // goes away entirely.
    let ids = next_clients(&mut clients).await;
    assert!(ids.is_empty());

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn malformed_frame_is_fatal_to_that_session_only() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();

    let mut first = connect_agent(&registry).await;
    let first_ids = next_clients(&mut clients).await;
    let mut second = connect_agent(&registry).await;
    let second_ids = next_clients(&mut clients).await;
    assert_eq!(second_ids.len(), 2);
    let first_id = first_ids[0].clone();
    let survivor_id = second_ids
        .iter()
        .find(|id| **id != first_id)
        .unwrap()
        .clone();

    let bad_peer = tokio::spawn(async move {
        let _ = first.read_json().await.unwrap();
        // A 2 MiB JSON frame: over the frame cap. The payload is sent too
        // so the reader can drain to the frame boundary before erroring.
        let oversized = vec![b'x'; 2 * 1024 * 1024];
        let raw = first.get_mut();
        raw.write_all(&(oversized.len() as u32).to_be_bytes())
            .await
            .unwrap();
        raw.write_all(&[0x01]).await.unwrap();
        raw.write_all(&oversized).await.unwrap();
        raw.flush().await.unwrap();
        first
    });

    let session = registry.get(&first_id).unwrap();
    let result = session.run_command("x", WAIT).await;
    assert!(matches!(result, ExecResult::Failed(_)));
    assert!(session.last_transfer_error().is_none()); // exec is not a transfer

    let ids = next_clients(&mut clients).await;
    assert_eq!(ids, vec![survivor_id.clone()]);
    assert!(registry.get(&survivor_id).is_some());

    bad_peer.await.unwrap();
    let _ = second.shutdown().await;
    registry.stop().await;
}

#[tokio::test]
async fn wrong_kind_download_records_protocol_mismatch() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "downloadfile", "error": ""}))
            .await
            .unwrap();
        // JSON where the binary payload should be.
        agent
            .write_json(&json!({"type": "downloadfile", "error": ""}))
            .await
            .unwrap();
        agent
    });

    let dir = tempfile::tempdir().unwrap();
    let session = registry.get(&id).unwrap();
    let result = session
        .download_file("/data/x", &dir.path().join("out"), None, WAIT)
        .await;
    assert_eq!(result, DownloadResult::Failed);
    assert_eq!(
        session.last_transfer_error().unwrap().kind,
        TransferErrorKind::ProtocolMismatch
    );

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn shell_send_streams_lines_and_end_marker() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "exec", "output": "one\ntwo\n"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    let mut events = session.subscribe_shell();
    session.send_shell("ls").await;

    assert_eq!(
        events.recv().await.unwrap(),
        ShellEvent::OutputLine("one".to_string())
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ShellEvent::OutputLine("two".to_string())
    );
    assert_eq!(events.recv().await.unwrap(), ShellEvent::CommandEnd);
    assert_eq!(session.output_log(), "one\ntwo\n");

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn lagging_shell_subscriber_drops_oldest_and_continues() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    const LINES: usize = 400; // over the 256 event buffer

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        let output: String = (0..LINES).map(|i| format!("line-{i}\n")).collect();
        agent
            .write_json(&json!({"type": "exec", "output": output}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    let mut events = session.subscribe_shell();
    // Producer publishes all events before this subscriber reads any.
    session.send_shell("spam").await;

    let first = events.recv().await;
    assert!(matches!(
        first,
        Err(broadcast::error::RecvError::Lagged(_))
    ));

    // After the lag report the subscriber resumes and reaches the marker.
    let mut saw_end = false;
    while let Ok(event) = events.recv().await {
        if event == ShellEvent::CommandEnd {
            saw_end = true;
            break;
        }
    }
    assert!(saw_end);

    // The full output survives in the replayable log regardless of lag.
    assert_eq!(session.output_log().lines().count(), LINES);

    peer.await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn failed_shell_send_emits_error_line() {
    let registry = start_registry().await;
    let mut clients = registry.subscribe();
    let (mut agent, id) = admit_agent(&registry, &mut clients).await;

    let peer = tokio::spawn(async move {
        let _ = agent.read_json().await.unwrap();
        agent
            .write_json(&json!({"type": "exec", "error": "no such device"}))
            .await
            .unwrap();
        agent
    });

    let session = registry.get(&id).unwrap();
    let mut events = session.subscribe_shell();
    session.send_shell("reboot").await;

    assert_eq!(
        events.recv().await.unwrap(),
        ShellEvent::OutputLine("[ERROR] no such device".to_string())
    );
    assert_eq!(events.recv().await.unwrap(), ShellEvent::CommandEnd);

    peer.await.unwrap();
    registry.stop().await;
}
