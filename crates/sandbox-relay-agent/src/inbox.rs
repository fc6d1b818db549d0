//! FIFO bridge between the bus listener and the step function.

use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::Notify;

struct Inner {
    queue: VecDeque<String>,
    closed: bool,
}

/// Ordered, unbounded queue of pending inbound messages.
///
/// Single producer (the bus listener), single consumer (the step loop).
/// `next` parks the consumer while the queue is empty and wakes on the
/// next push; after `close`, it drains what remains and then returns
/// `None` so the consumer observes end-of-sequence instead of hanging.
pub struct Inbox {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Inbox {
    /// Create an empty, open inbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a message, waking a parked consumer.
    ///
    /// Returns `false` if the inbox has been closed; the message is dropped.
    pub fn push(&self, message: String) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            inner.queue.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Close the inbox: pending messages stay consumable, then `next`
    /// returns `None`. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    /// Pull the next message in FIFO order, waiting if none is queued.
    ///
    /// Returns `None` once the inbox is closed and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Register for the wakeup before re-checking the queue, so a
            // push between the check and the await cannot be lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(message) = inner.queue.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let inbox = Inbox::new();
        assert!(inbox.push("a".into()));
        assert!(inbox.push("b".into()));
        assert!(inbox.push("c".into()));

        assert_eq!(inbox.next().await.as_deref(), Some("a"));
        assert_eq!(inbox.next().await.as_deref(), Some("b"));
        assert_eq!(inbox.next().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_parked_consumer_wakes_on_push() {
        let inbox = Arc::new(Inbox::new());

        let consumer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.push("wake".into());

        assert_eq!(consumer.await.unwrap().as_deref(), Some("wake"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let inbox = Inbox::new();
        inbox.push("last".into());
        inbox.close();

        assert_eq!(inbox.next().await.as_deref(), Some("last"));
        assert_eq!(inbox.next().await, None);
        // Still ended on a second pull.
        assert_eq!(inbox.next().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_consumer() {
        let inbox = Arc::new(Inbox::new());

        let consumer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.close();

        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let inbox = Inbox::new();
        inbox.close();
        assert!(!inbox.push("late".into()));
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn test_no_messages_skipped_under_interleaving() {
        let inbox = Arc::new(Inbox::new());
        let producer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move {
                for i in 0..100 {
                    inbox.push(i.to_string());
                    if i % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                inbox.close();
            })
        };

        let mut seen = Vec::new();
        while let Some(message) = inbox.next().await {
            seen.push(message);
        }
        producer.await.unwrap();

        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }
}
