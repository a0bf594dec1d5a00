//! Per-socket send queues.
//!
//! Each outbound socket direction gets one [`SendQueue`]: a strict FIFO of
//! encoded frames, each with an optional completion signal. Entries
//! accumulate while the owning endpoint is disconnected and drain once a
//! socket is available. The owning task calls [`SendQueue::drain`] from a
//! single place, which keeps at most one write in flight per queue.

use std::collections::VecDeque;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::frame::Frame;

struct QueueEntry {
    bytes: Vec<u8>,
    ack: Option<oneshot::Sender<()>>,
}

/// FIFO of pending frames for one socket.
#[derive(Default)]
pub struct SendQueue {
    entries: VecDeque<QueueEntry>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `frame` and appends it. The `ack` fires once the frame has
    /// been fully written to a socket.
    pub fn push(&mut self, frame: &Frame, ack: Option<oneshot::Sender<()>>) -> anyhow::Result<()> {
        let bytes = frame.encode()?;
        self.entries.push_back(QueueEntry { bytes, ack });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes queued frames to `writer` in order, acking each entry after its
    /// bytes are fully written.
    ///
    /// On a write error the head entry stays queued (it will be re-sent on
    /// the next connection) and the error is returned so the caller can tear
    /// the socket down.
    pub async fn drain<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(entry) = self.entries.pop_front() {
            if let Err(e) = writer.write_all(&entry.bytes).await {
                self.entries.push_front(entry);
                return Err(e);
            }
            if let Some(ack) = entry.ack {
                let _ = ack.send(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn acks_fire_in_enqueue_order() {
        let mut queue = SendQueue::new();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue
                .push(&Frame::command("seq", json!(i)), Some(tx))
                .unwrap();
            receivers.push(rx);
        }

        let mut sink: Vec<u8> = Vec::new();
        queue.drain(&mut sink).await.unwrap();
        assert!(queue.is_empty());

        // All three completed; order is observable through the sink contents.
        for rx in receivers {
            rx.await.unwrap();
        }
        let frames = crate::codec::parse(&sink);
        let order: Vec<_> = frames.iter().map(|f| f.data.clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn entries_survive_until_drained() {
        let mut queue = SendQueue::new();
        queue.push(&Frame::command("a", json!(null)), None).unwrap();
        queue.push(&Frame::command("b", json!(null)), None).unwrap();
        assert_eq!(queue.len(), 2);

        let mut sink: Vec<u8> = Vec::new();
        queue.drain(&mut sink).await.unwrap();
        assert_eq!(queue.len(), 0);
        assert_eq!(crate::codec::parse(&sink).len(), 2);
    }
}
