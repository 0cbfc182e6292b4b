//! Frame buffers shared between session tasks and the node.
//!
//! [`FramedBuffer`] is the inbound staging area: the receive task feeds it raw
//! chunks and the node's handler pulls whole envelopes out of it.
//! [`FrameQueue`] is the outbound staging area: the node enqueues encoded
//! frames for a remote and that remote's write task drains them.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

use crate::envelope::Envelope;
use crate::frame::FrameDecoder;
use crate::WireError;

/// Ordered queue with blocking get
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Queue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut VecDeque<T>) -> R) -> R {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut items)
    }

    /// Append an item at the back
    pub fn put(&self, item: T) {
        self.with_items(|items| items.push_back(item));
        self.notify.notify_one();
    }

    /// Return an item to the front, ahead of everything queued
    pub fn put_front(&self, item: T) {
        self.with_items(|items| items.push_front(item));
        self.notify.notify_one();
    }

    /// Take the next item without waiting
    pub fn try_get(&self) -> Option<T> {
        self.with_items(|items| items.pop_front())
    }

    /// Wait for the next item
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Wait for the next item, giving up after `timeout`
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.get()).await.ok()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.with_items(|items| items.len())
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound queue of encoded frames for one remote
pub type FrameQueue = Queue<Bytes>;

/// Inbound buffer that reassembles envelopes from raw chunks
#[derive(Debug)]
pub struct FramedBuffer {
    pending: Mutex<(FrameDecoder, BytesMut)>,
    frames: Queue<Envelope>,
}

impl FramedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            pending: Mutex::new((FrameDecoder::new(), BytesMut::with_capacity(64 * 1024))),
            frames: Queue::new(),
        }
    }

    /// Feed a chunk; every frame it completes becomes available to `get`.
    ///
    /// Returns the number of envelopes completed by this chunk.
    pub fn put(&self, chunk: &[u8]) -> Result<usize, WireError> {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let (decoder, partial) = &mut *guard;
        partial.extend_from_slice(chunk);

        // Frames ahead of a bad one stay available
        let mut count = 0;
        while let Some(envelope) = decoder.decode(partial)? {
            self.frames.put(envelope);
            count += 1;
        }
        trace!(
            "Buffered {} bytes, {} frames complete, {} bytes pending",
            chunk.len(),
            count,
            partial.len()
        );
        Ok(count)
    }

    /// Wait for the next complete envelope
    pub async fn get(&self) -> Envelope {
        self.frames.get().await
    }

    /// Wait for the next envelope, giving up after `timeout`
    pub async fn get_timeout(&self, timeout: Duration) -> Option<Envelope> {
        self.frames.get_timeout(timeout).await
    }

    /// Number of complete envelopes waiting
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no complete envelope is waiting
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for FramedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_front_goes_first() {
        let queue = FrameQueue::new();
        queue.put(Bytes::from_static(b"second"));
        queue.put(Bytes::from_static(b"third"));
        queue.put_front(Bytes::from_static(b"first"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_get().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(queue.try_get().unwrap(), Bytes::from_static(b"second"));
        assert_eq!(queue.try_get().unwrap(), Bytes::from_static(b"third"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(FrameQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.put(Bytes::from_static(b"late"));

        assert_eq!(waiter.await.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_timeout_expires() {
        let queue = FrameQueue::new();
        assert!(queue.get_timeout(Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_framed_buffer_reassembles_chunks() {
        let buffer = FramedBuffer::new();
        let first = Envelope::hi("node-a").encode().unwrap();
        let second = Envelope::hi("node-b").encode().unwrap();

        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);
        let (head, tail) = stream.split_at(first.len() + 3);

        assert_eq!(buffer.put(head).unwrap(), 1);
        assert_eq!(buffer.put(tail).unwrap(), 1);

        assert_eq!(buffer.get().await.sender(), "node-a");
        assert_eq!(buffer.get().await.sender(), "node-b");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_frames_before_corruption_are_kept() {
        let buffer = FramedBuffer::new();
        let good = Envelope::hi("node-a").encode().unwrap();
        let mut bad = Envelope::hi("node-b").encode().unwrap().to_vec();
        if let Some(last) = bad.last_mut() {
            *last ^= 0xff;
        }

        let mut chunk = good.to_vec();
        chunk.extend_from_slice(&bad);

        assert!(matches!(buffer.put(&chunk), Err(WireError::Checksum)));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get().await.sender(), "node-a");
    }
}
