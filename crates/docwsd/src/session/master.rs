//! Server-side sessions pairing clients with workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docwsd_protocol::{ControlLine, abbreviate, first_line, tokenize};
use log::{debug, info, warn};
use tokio::sync::OnceCell;

use super::{Outbox, SessionFactory, SessionHandler, SessionKind};
use crate::pool::{WorkerLink, WorkerPool};

/// Creates [`MasterSession`]s bound to one pool.
#[derive(Debug, Clone)]
pub struct MasterSessions {
    pool: Arc<WorkerPool>,
    claim_timeout: Duration,
}

impl MasterSessions {
    pub fn new(pool: Arc<WorkerPool>, claim_timeout: Duration) -> Self {
        Self {
            pool,
            claim_timeout,
        }
    }
}

impl SessionFactory for MasterSessions {
    fn create(&self, kind: SessionKind, outbox: Outbox) -> Arc<dyn SessionHandler> {
        Arc::new(MasterSession {
            kind,
            outbox,
            pool: Arc::clone(&self.pool),
            claim_timeout: self.claim_timeout,
            link: OnceCell::new(),
        })
    }
}

/// One side of a client/worker pairing.
///
/// A worker session registers its worker on the greeting and forwards
/// everything after it to the paired client. A client session claims a
/// worker on its first message and forwards everything to it.
#[derive(Debug)]
pub struct MasterSession {
    kind: SessionKind,
    outbox: Outbox,
    pool: Arc<WorkerPool>,
    claim_timeout: Duration,
    link: OnceCell<WorkerLink>,
}

impl MasterSession {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn handle_worker_input(&self, payload: &[u8]) -> bool {
        let Some(link) = self.link.get() else {
            return self.register(payload);
        };

        match link.client() {
            Some(client) => {
                if !client.send_payload(payload) {
                    debug!("Client of worker {} is gone", link.worker_id());
                    return false;
                }
                true
            }
            None => {
                debug!(
                    "Worker {} has no client, dropping {}",
                    link.worker_id(),
                    abbreviate(payload)
                );
                true
            }
        }
    }

    fn register(&self, payload: &[u8]) -> bool {
        let line = String::from_utf8_lossy(first_line(payload));
        let worker_id = match ControlLine::parse_greeting(&line) {
            Ok(worker_id) => worker_id,
            Err(e) => {
                warn!("Rejecting worker connection: {}", e);
                return false;
            }
        };

        let link = WorkerLink::new(worker_id, self.outbox.clone());
        if self.link.set(link.clone()).is_err() {
            return false;
        }
        self.pool.register_worker(link);
        true
    }

    async fn handle_client_input(&self, payload: &[u8]) -> bool {
        let line = String::from_utf8_lossy(first_line(payload));
        if self.link.get().is_none() && ControlLine::parse(&line) == Some(ControlLine::CancelTiles) {
            // Nothing has been sent to a worker yet, so there is nothing to cancel.
            return true;
        }

        let link = match self.link.get_or_try_init(|| self.claim()).await {
            Ok(link) => link,
            Err(()) => {
                let verb = tokenize(&line).first().copied().unwrap_or_default();
                self.outbox
                    .send_text(format!("error: cmd={verb} kind=noworker"));
                self.outbox.close();
                return false;
            }
        };

        if !link.outbox().send_payload(payload) {
            info!("Worker {} went away", link.worker_id());
            self.outbox.close();
            return false;
        }
        true
    }

    async fn claim(&self) -> Result<WorkerLink, ()> {
        loop {
            let Some(link) = self.pool.claim_worker(self.claim_timeout).await else {
                warn!(
                    "No worker became available within {:?}",
                    self.claim_timeout
                );
                return Err(());
            };
            if link.attach_client(self.outbox.clone()) {
                info!("Client paired with worker {}", link.worker_id());
                return Ok(link);
            }
        }
    }
}

#[async_trait]
impl SessionHandler for MasterSession {
    async fn handle_input(&self, payload: &[u8]) -> bool {
        match self.kind {
            SessionKind::ToWorker => self.handle_worker_input(payload).await,
            SessionKind::ToClient => self.handle_client_input(payload).await,
        }
    }

    async fn disconnected(&self) {
        let Some(link) = self.link.get() else {
            return;
        };
        match self.kind {
            SessionKind::ToWorker => {
                self.pool.unregister_worker(link.worker_id());
                if let Some(client) = link.detach_client() {
                    client.close();
                }
            }
            SessionKind::ToClient => {
                debug!("Client of worker {} disconnected", link.worker_id());
                link.detach_client();
                link.outbox().close();
            }
        }
    }
}
