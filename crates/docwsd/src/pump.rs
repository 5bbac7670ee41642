//! Queue pump: drains a session's queue into its handler.
//!
//! The pump runs beside the socket-reading loop so that a later `canceltiles`
//! can discard queued work before the handler gets to it.

use std::sync::Arc;

use log::debug;
use tokio::task::JoinHandle;

use crate::queue::{MessageQueue, QueueEntry};
use crate::session::SessionHandler;

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The end-of-stream sentinel was received.
    Eof,
    /// The handler rejected a message.
    Rejected,
}

/// A running pump bound to one queue and one session for its whole lifetime.
#[derive(Debug)]
pub struct QueuePump {
    task: JoinHandle<PumpExit>,
}

impl QueuePump {
    /// Start draining `queue` into `handler` on a dedicated task.
    pub fn start(queue: Arc<MessageQueue>, handler: Arc<dyn SessionHandler>) -> Self {
        let task = tokio::spawn(run(queue, handler));
        Self { task }
    }

    /// Wait for the pump to stop.
    ///
    /// Does not stop it: callers close the queue first.
    pub async fn join(self) -> PumpExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                debug!("queue pump task ended abnormally: {}", e);
                PumpExit::Rejected
            }
        }
    }

    /// Whether the pump has already stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Pump loop. Stops on the sentinel or the first rejected message.
///
/// A rejection does not close anything; the owning endpoint tears down.
pub async fn run(queue: Arc<MessageQueue>, handler: Arc<dyn SessionHandler>) -> PumpExit {
    loop {
        match queue.get().await {
            QueueEntry::Eof => return PumpExit::Eof,
            QueueEntry::Payload(message) => {
                if !handler.handle_input(message.as_bytes()).await {
                    debug!("handler rejected queued message, stopping pump");
                    return PumpExit::Rejected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingHandler;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pump_delivers_in_order_until_eof() {
        let queue = Arc::new(MessageQueue::new());
        let handler = Arc::new(RecordingHandler::default());
        let pump = QueuePump::start(Arc::clone(&queue), handler.clone());

        queue.put("load url=file:///doc.odt");
        queue.put("tile part=0");
        queue.put("status");
        queue.put_eof();
        queue.put("after eof");

        assert_eq!(pump.join().await, PumpExit::Eof);
        assert_eq!(
            handler.received(),
            vec!["load url=file:///doc.odt", "tile part=0", "status"]
        );
    }

    #[tokio::test]
    async fn test_pump_stops_on_rejection() {
        let queue = Arc::new(MessageQueue::new());
        let handler = Arc::new(RecordingHandler::rejecting("bad"));
        let pump = QueuePump::start(Arc::clone(&queue), handler.clone());

        queue.put("good");
        queue.put("bad");
        queue.put("never");

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.join())
            .await
            .expect("pump stopped");
        assert_eq!(exit, PumpExit::Rejected);
        assert_eq!(handler.received(), vec!["good", "bad"]);
        assert_eq!(queue.snapshot(), vec!["never"]);
    }

    #[tokio::test]
    async fn test_pump_waits_on_empty_queue() {
        let queue = Arc::new(MessageQueue::new());
        let handler = Arc::new(RecordingHandler::default());
        let pump = QueuePump::start(Arc::clone(&queue), handler.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pump.is_finished());

        queue.close();
        assert_eq!(pump.join().await, PumpExit::Eof);
        assert!(handler.received().is_empty());
    }
}
