//! Shared helpers for tests that talk to a local HTTP server.

use wiremock::MockServer;

/// Starts a local server for the calling test.
///
/// Sandboxed runners may forbid binding loopback sockets. The test is then
/// skipped with a note on stderr, unless `COURIER_NETWORK_TESTS=strict` is
/// set, in which case it fails.
#[track_caller]
pub fn local_server() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = std::panic::Location::caller();
    let loopback = std::net::TcpListener::bind(("127.0.0.1", 0)).map(drop);

    async move {
        match loopback {
            Ok(()) => Some(MockServer::start().await),
            Err(e) if std::env::var("COURIER_NETWORK_TESTS").as_deref() == Ok("strict") => {
                panic!("{caller}: loopback bind failed: {e}")
            }
            Err(e) => {
                eprintln!("{caller}: loopback bind failed ({e}), skipping");
                None
            }
        }
    }
}
