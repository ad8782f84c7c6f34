//! Process-wide default session
//!
//! Kept in its own test binary: the default instance is global.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use peerlink_core::PeerlinkError;
use peerlink_harness::MockTransport;
use peerlink_runtime::{default_session, try_default_session, PeerSession, PeerlinkConfig};

#[tokio::test]
async fn test_default_session_is_built_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    assert!(try_default_session().is_none());

    let failed = default_session(|| {
        Err(PeerlinkError::config_error("transport not ready"))
    });
    assert!(failed.is_err());
    assert!(try_default_session().is_none());

    let factory = || {
        builds.fetch_add(1, Ordering::SeqCst);
        PeerSession::builder(Arc::new(MockTransport::cluster()))
            .with_config(PeerlinkConfig::testing())
            .build()
    };
    let first = default_session(factory).unwrap();
    let second = default_session(factory).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &try_default_session().unwrap()));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}
