//! Queueing of incoming group call start messages.

use crate::protocol::GroupCallStartMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Bounded FIFO of pending call start messages.
///
/// When the queue is full the oldest message is dropped so that a burst of
/// starts cannot stall newer ones. A single consumer drains it via [`pop`].
///
/// [`pop`]: StartQueue::pop
pub struct StartQueue {
    queue: Mutex<VecDeque<GroupCallStartMessage>>,
    capacity: usize,
    notify: Notify,
}

impl StartQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue a message, returning `true` if an older message was dropped
    /// to make room.
    pub fn push(&self, message: GroupCallStartMessage) -> bool {
        let dropped = {
            let mut queue = self.queue.lock().unwrap();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(message);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait for and remove the oldest queued message.
    pub async fn pop(&self) -> GroupCallStartMessage {
        loop {
            if let Some(message) = self.queue.lock().unwrap().pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
