//! Range handling of the http transport

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::common::hash::NixHash;
use ::common::index::Composable;
use ::common::source::{HttpTransport, Source, SourceError, Transport};
use ::common::task::{Progress, Signal, TransferContext, TransferError};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::watch;

fn payload() -> Vec<u8> {
    (0..5000u32).map(|i| (i % 241) as u8).collect()
}

async fn transfer(base: &str, output: &std::path::Path, progress: &Progress) -> Result<(), TransferError> {
    let transport = HttpTransport::new(base, Duration::from_secs(5)).unwrap();
    let composable = Composable::new(NixHash::from("chunk"), payload().len() as u64);
    let adapter = transport.task(&composable);
    let (_signal, rx) = watch::channel(Signal::Run);
    let mut ctx = TransferContext::new(composable, output.to_path_buf(), progress.clone(), rx);
    adapter.start(&mut ctx).await
}

#[tokio::test]
async fn test_range_request_appends() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("served");
    std::fs::create_dir_all(root.join("store")).unwrap();
    std::fs::write(root.join("store").join("chunk"), payload()).unwrap();
    let base = common::serve_dir(&root).await;

    // first 1200 bytes are already on disk
    let output = temp.path().join("chunk");
    std::fs::write(&output, &payload()[..1200]).unwrap();
    let progress = Progress::default();
    progress.add(1200);

    transfer(&base, &output, &progress).await.unwrap();
    assert_eq!(progress.get(), payload().len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), payload());
}

#[derive(Clone, Default)]
struct Seen {
    ranged: Arc<AtomicUsize>,
}

// answers every request with the full body, ignoring ranges
async fn full_body(State(seen): State<Seen>, headers: HeaderMap) -> (StatusCode, Vec<u8>) {
    if headers.contains_key("range") {
        seen.ranged.fetch_add(1, Ordering::SeqCst);
    }
    (StatusCode::OK, payload())
}

#[tokio::test]
async fn test_ignored_range_restarts_from_zero() {
    let seen = Seen::default();
    let router = Router::new()
        .route("/store/chunk", get(full_body))
        .with_state(seen.clone());
    let base = common::serve(router).await;

    let temp = TempDir::new().unwrap();
    let output = temp.path().join("chunk");
    // the partial bytes don't even match, they must be thrown away
    std::fs::write(&output, vec![0xAAu8; 700]).unwrap();
    let progress = Progress::default();
    progress.add(700);

    transfer(&base, &output, &progress).await.unwrap();
    assert_eq!(seen.ranged.load(Ordering::SeqCst), 1);
    assert_eq!(progress.get(), payload().len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), payload());
}

#[tokio::test]
async fn test_error_status_fails_transfer() {
    let router = Router::new().route("/store/chunk", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let base = common::serve(router).await;

    let temp = TempDir::new().unwrap();
    let result = transfer(&base, &temp.path().join("chunk"), &Progress::default()).await;
    assert!(matches!(result, Err(TransferError::Status(503))));
}

#[tokio::test]
async fn test_missing_index() {
    let temp = TempDir::new().unwrap();
    let base = common::serve_dir(temp.path()).await;
    let source = Source::from_uri(&base, Duration::from_secs(5)).unwrap();

    let err = source.fetch_index("nereid.json").await.unwrap_err();
    assert!(matches!(err, SourceError::IndexNotFound(_)));
}
