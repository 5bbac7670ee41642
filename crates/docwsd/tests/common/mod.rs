//! Shared setup for tests that run the real binary as workers.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use docwsd::pool::privilege::DebugIdentity;
use docwsd::pool::supervisor::LaunchSpec;
use docwsd::server::{self, RunningServer, ServerOptions};
use tempfile::TempDir;

/// A server on ephemeral ports whose workers run without a jail unless
/// told otherwise.
pub struct TestServer {
    pub server: RunningServer,
    _state: TempDir,
}

pub async fn start_server(prespawn: usize) -> TestServer {
    start_server_with(prespawn, |_, _| {}).await
}

/// Like [`start_server`], letting the caller adjust how children are launched.
/// `customize` gets the server's scratch directory.
pub async fn start_server_with(
    prespawn: usize,
    customize: impl FnOnce(&Path, &mut LaunchSpec),
) -> TestServer {
    let state = TempDir::new().expect("temp dir");
    let mut options = ServerOptions {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_port: 0,
        worker_port: 0,
        prespawn,
        claim_timeout: Duration::from_secs(10),
        spawn_backoff: Duration::from_millis(200),
        launch: LaunchSpec {
            program: PathBuf::from(env!("CARGO_BIN_EXE_docwsd")),
            worker_port: 0,
            transfer_port: 0,
            lock_file: state.path().join("docwsd.lock"),
            jail: None,
            debug: DebugIdentity::default(),
            log_filter: Some("docwsd=debug".to_string()),
        },
    };
    customize(state.path(), &mut options.launch);
    let server = server::start(options).await.expect("server starts");
    TestServer {
        server,
        _state: state,
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
