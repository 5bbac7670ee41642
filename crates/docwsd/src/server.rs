//! Dual-listener bootstrap.
//!
//! Binds the public client listener and the loopback worker listener, serves
//! both through the relay, launches the container and the first workers
//! while holding the startup lock, then hands over to the supervisor.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::WorkerPool;
use crate::pool::lock::NamedLock;
use crate::pool::supervisor::{LaunchSpec, Supervisor, SupervisorExit};
use crate::relay::{self, RelayState};
use crate::session::MasterSessions;

/// Settings for [`start`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: IpAddr,
    /// `0` picks a free port.
    pub client_port: u16,
    /// `0` picks a free port; workers are told the bound one.
    pub worker_port: u16,
    pub prespawn: usize,
    pub claim_timeout: Duration,
    pub spawn_backoff: Duration,
    /// `worker_port` is overwritten with the bound port.
    pub launch: LaunchSpec,
}

/// A started server.
#[derive(Debug)]
pub struct RunningServer {
    pub client_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    pub pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<SupervisorExit>,
    listeners: Vec<JoinHandle<()>>,
}

/// Bring the server up.
pub async fn start(options: ServerOptions) -> Result<RunningServer> {
    let lock = NamedLock::open(&options.launch.lock_file)?;
    let guard = lock.hold()?;

    let client_listener = bind(
        SocketAddr::new(options.host, options.client_port),
        options.prespawn * 10,
    )
    .context("binding client listener")?;
    let worker_listener = bind(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), options.worker_port),
        options.prespawn,
    )
    .context("binding worker listener")?;
    let client_addr = client_listener.local_addr()?;
    let worker_addr = worker_listener.local_addr()?;
    info!("Listening for clients on {}", client_addr);
    info!("Listening for workers on {}", worker_addr);

    let pool = Arc::new(WorkerPool::new(options.prespawn));
    let sessions = Arc::new(MasterSessions::new(
        Arc::clone(&pool),
        options.claim_timeout,
    ));
    let shutdown = CancellationToken::new();

    let listeners = [client_listener, worker_listener]
        .into_iter()
        .zip([client_addr, worker_addr])
        .map(|(listener, addr)| {
            let app = relay::router(RelayState::new(
                addr.port(),
                worker_addr.port(),
                sessions.clone(),
            ));
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    warn!("Listener {} stopped: {}", addr, e);
                }
            })
        })
        .collect();

    let mut launch = options.launch;
    launch.worker_port = worker_addr.port();
    if launch.jail.is_some() {
        warn!("Jail directories are not removed when workers exit");
    }
    let supervisor = Supervisor::new(Arc::clone(&pool), launch, options.spawn_backoff);
    if let Err(e) = supervisor.spawn_container() {
        warn!("Failed to launch container process: {}", e);
    }
    let launched = supervisor.prespawn();
    info!("Pre-spawned {} of {} workers", launched, options.prespawn);

    drop(guard);
    drop(lock);

    let supervisor = tokio::spawn(supervisor.run(shutdown.clone().cancelled_owned()));

    Ok(RunningServer {
        client_addr,
        worker_addr,
        pool,
        shutdown,
        supervisor,
        listeners,
    })
}

impl RunningServer {
    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the supervisor and both listeners have stopped.
    pub async fn wait(self) -> Result<SupervisorExit> {
        let exit = self.supervisor.await.context("supervisor task failed")?;
        // The supervisor can stop on its own; take the listeners down with it.
        self.shutdown.cancel();
        for listener in self.listeners {
            let _ = listener.await;
        }
        info!("Server stopped ({:?})", exit);
        Ok(exit)
    }
}

/// Bind a listener with an explicit backlog.
pub fn bind(addr: SocketAddr, backlog: usize) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(u32::try_from(backlog).unwrap_or(u32::MAX).max(1))
}
