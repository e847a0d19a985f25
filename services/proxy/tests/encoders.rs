//! External payload encoders in a running proxy.
#![cfg(unix)]


use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{eventually, read_exactly, wait_closed, ProxyHandle, TcpEchoBackend};
use hl7_mllp::{wrap, EncoderFailurePolicy};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_source_encoder_converts_client_frames() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "upper.sh", "tr 'a-z' 'A-Z' < \"$1\" > \"$2\"\n");

    let backend = TcpEchoBackend::spawn().await.unwrap();
    let command = format!("sh {}", script.display());
    let proxy = ProxyHandle::spawn_with(backend.addr, move |config| {
        config.source_encoder = Some(command);
    })
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(&wrap(b"msh|pid|obx")).await.unwrap();

    let expected = wrap(b"MSH|PID|OBX");
    let echoed = read_exactly(&mut client, expected.len(), WAIT).await.unwrap();
    assert_eq!(echoed, expected.to_vec());
    assert_eq!(backend.received(), expected.to_vec());
}

#[tokio::test]
async fn test_destination_encoder_converts_backend_frames() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "lower.sh", "tr 'A-Z' 'a-z' < \"$1\" > \"$2\"\n");

    let backend = TcpEchoBackend::spawn().await.unwrap();
    let command = format!("sh {}", script.display());
    let proxy = ProxyHandle::spawn_with(backend.addr, move |config| {
        config.destination_encoder = Some(command);
    })
    .await
    .unwrap();

    let frame = wrap(b"MSA|AA");
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(&frame).await.unwrap();

    let expected = wrap(b"msa|aa");
    let echoed = read_exactly(&mut client, expected.len(), WAIT).await.unwrap();
    assert_eq!(echoed, expected.to_vec());
    assert_eq!(backend.received(), frame.to_vec());
}

#[tokio::test]
async fn test_failing_encoder_closes_session_but_not_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fail.sh", "echo broken >&2\nexit 3\n");

    let backend = TcpEchoBackend::spawn().await.unwrap();
    let command = format!("sh {}", script.display());
    let proxy = ProxyHandle::spawn_with(backend.addr, move |config| {
        config.source_encoder = Some(command);
        config.encoder_failure = EncoderFailurePolicy::CloseSession;
    })
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(&wrap(b"MSH|one")).await.unwrap();
    assert!(wait_closed(&mut client, WAIT).await, "session should close");
    assert!(backend.received().is_empty());

    // The proxy keeps accepting clients.
    let mut next = TcpStream::connect(proxy.listen_addr).await.unwrap();
    next.write_all(&wrap(b"MSH|two")).await.unwrap();
    assert!(wait_closed(&mut next, WAIT).await, "session should close");

    let stats = proxy.stats.clone();
    assert!(
        eventually(WAIT, || stats.sessions_completed.load(Ordering::Relaxed) == 2).await,
        "both sessions should complete"
    );
}

#[tokio::test]
async fn test_forward_policy_relays_original_frame() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fail.sh", "exit 1\n");

    let backend = TcpEchoBackend::spawn().await.unwrap();
    let command = format!("sh {}", script.display());
    let proxy = ProxyHandle::spawn_with(backend.addr, move |config| {
        config.source_encoder = Some(command);
        config.encoder_failure = EncoderFailurePolicy::Forward;
    })
    .await
    .unwrap();

    let frame = wrap(b"MSH|as-is");
    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(&frame).await.unwrap();

    let echoed = read_exactly(&mut client, frame.len(), WAIT).await.unwrap();
    assert_eq!(echoed, frame.to_vec());
}
