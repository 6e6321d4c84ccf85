//! In-memory transport pair for tests (ambient §10.4), gated behind `cfg(test)` or the `testing`
//! feature so downstream crates that want to exercise a `Peer` end-to-end in their own tests can
//! depend on `lspy` with `features = ["testing"]` without needing a real socket or subprocess.

use std::sync::Arc;

use crate::transport::FramedTransport;

/// An in-process duplex pipe framed the same way a real stdio/socket transport would be,
/// suitable for wiring two [`crate::peer::Peer`]s together without any I/O.
pub fn duplex_pair(buffer_size: usize) -> (Arc<FramedTransport>, Arc<FramedTransport>) {
    let (a_io, b_io) = tokio::io::duplex(buffer_size);
    let (a_read, a_write) = tokio::io::split(a_io);
    let (b_read, b_write) = tokio::io::split(b_io);
    (FramedTransport::spawn(a_read, a_write), FramedTransport::spawn(b_read, b_write))
}

/// Installs a `tracing-subscriber` `fmt` layer for tests that want visible output. Only available
/// within this crate's own test runs, not behind the `testing` feature, since `tracing-subscriber`
/// is a dev-dependency. Idempotent across tests in the same binary.
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    #[tokio::test]
    async fn duplex_pair_round_trips_a_message() {
        init_test_tracing();
        let (a, b) = duplex_pair(4096);
        let received = Arc::new(tokio::sync::Mutex::new(None));
        let received_clone = received.clone();
        let _disposer = b
            .subscribe_message(Box::new(move |value| {
                let received_clone = received_clone.clone();
                tokio::spawn(async move {
                    *received_clone.lock().await = Some(value);
                });
            }))
            .await;

        a.send(serde_json::json!({"jsonrpc": "2.0", "method": "ping", "params": null})).await.unwrap();

        for _ in 0..50 {
            if received.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(received.lock().await.is_some());
    }
}
