//! In-process links.
//!
//! `link()` returns the two ends of a link between an app and a service it
//! connects to. Tests use them directly to wire connections together.

use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

type Outbox = mpsc::UnboundedSender<Vec<u8>>;
type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// One end of an in-process link.
///
/// Dropping the outbox on `close` is what the other end sees as end of
/// stream, after it has drained what was already queued.
pub struct ChannelEnd {
    outbox: Mutex<Option<Outbox>>,
    inbox: AsyncMutex<Inbox>,
}

/// Two ends wired crosswise.
pub fn link() -> (ChannelEnd, ChannelEnd) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    (ChannelEnd::new(to_b, from_b), ChannelEnd::new(to_a, from_a))
}

impl ChannelEnd {
    fn new(outbox: Outbox, inbox: Inbox) -> Self {
        Self { outbox: Mutex::new(Some(outbox)), inbox: AsyncMutex::new(inbox) }
    }

    fn outbox(&self) -> transport::Result<std::sync::MutexGuard<'_, Option<Outbox>>> {
        self.outbox.lock().map_err(|_| transport::Error::Io("outbox lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelEnd {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        match self.outbox()?.as_ref() {
            Some(outbox) => outbox.send(payload.to_vec())
                .map_err(|_| transport::Error::ConnectionLost("other end dropped".into())),
            None => Err(transport::Error::Closed),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        self.outbox()?.take();
        Ok(())
    }
}
