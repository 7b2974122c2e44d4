//! SIGTERM drives the same shutdown flag as Ctrl+C
//!
//! Kept in its own test binary: it signals the whole process.

#![cfg(unix)]

use proximity_alert::infra::install_shutdown_handler;
use std::process::Command;
use std::time::Duration;

#[tokio::test]
async fn test_sigterm_requests_shutdown() {
    let mut shutdown_rx = install_shutdown_handler().unwrap();
    assert!(!*shutdown_rx.borrow());

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), shutdown_rx.changed()).await.unwrap().unwrap();
    assert!(*shutdown_rx.borrow());
}
