//! In-process mailboxes.
//!
//! Every registered agent owns one mailbox holding a queue per priority tier.
//! Any number of producers may `send` concurrently; each mailbox is expected
//! to have a single consumer calling `receive` or `wait`. Mailbox contents
//! live for the lifetime of the process only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::{gauge, increment_counter};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::message::{Message, Priority};
use crate::BrokerError;

#[derive(Debug, Default)]
struct Mailbox {
    // Indexed by `Priority::tier`
    queues: Mutex<[VecDeque<Message>; 3]>,
    arrivals: Notify,
}

impl Mailbox {
    async fn len(&self) -> usize {
        self.queues.lock().await.iter().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Default)]
pub struct MessageBroker {
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty mailbox for `name`. Registering an existing name is a
    /// no-op; returns whether a new mailbox was created.
    pub async fn register(&self, name: &str) -> Result<bool, BrokerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BrokerError::InvalidName);
        }

        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(name) {
            return Ok(false);
        }
        mailboxes.insert(name.to_string(), Arc::new(Mailbox::default()));
        tracing::info!(agent = %name, "Mailbox registered");
        Ok(true)
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.mailboxes.read().await.contains_key(name)
    }

    /// Registered agent names, sorted
    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mailboxes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn mailbox(&self, name: &str) -> Result<Arc<Mailbox>, BrokerError> {
        self.mailboxes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownRecipient(name.to_string()))
    }

    /// Queues a message for `to`, behind earlier messages of the same
    /// priority and ahead of all lower-priority ones.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        content: impl Into<String>,
        context: HashMap<String, String>,
        priority: Priority,
    ) -> Result<Uuid, BrokerError> {
        self.deliver(Message::new(from, to, content, context, priority))
            .await
    }

    /// Queues a pre-built message for `message.to`.
    pub async fn deliver(&self, message: Message) -> Result<Uuid, BrokerError> {
        let mailbox = self.mailbox(&message.to).await?;
        let id = message.id;
        let priority = message.priority;
        let to = message.to.clone();

        let depth = {
            let mut queues = mailbox.queues.lock().await;
            queues[priority.tier()].push_back(message);
            queues.iter().map(VecDeque::len).sum::<usize>()
        };
        mailbox.arrivals.notify_one();

        increment_counter!("broker_messages_sent_total", "priority" => priority.to_string());
        gauge!("broker_mailbox_depth", depth as f64, "agent" => to.clone());
        tracing::debug!(message_id = %id, to = %to, priority = %priority, "Message queued");
        Ok(id)
    }

    /// Removes and returns up to `limit` messages in delivery order. Never
    /// blocks; an empty mailbox yields an empty list.
    pub async fn receive(&self, name: &str, limit: usize) -> Result<Vec<Message>, BrokerError> {
        let mailbox = self.mailbox(name).await?;
        let mut queues = mailbox.queues.lock().await;

        let mut out = Vec::with_capacity(limit.min(64));
        for tier in Priority::DELIVERY_ORDER {
            let queue = &mut queues[tier.tier()];
            while out.len() < limit {
                match queue.pop_front() {
                    Some(message) => out.push(message),
                    None => break,
                }
            }
        }

        if !out.is_empty() {
            let depth: usize = queues.iter().map(VecDeque::len).sum();
            gauge!("broker_mailbox_depth", depth as f64, "agent" => name.to_string());
        }
        Ok(out)
    }

    /// Number of undelivered messages for `name`
    pub async fn pending(&self, name: &str) -> Result<usize, BrokerError> {
        Ok(self.mailbox(name).await?.len().await)
    }

    /// Waits until `name` has at least one pending message or `timeout`
    /// passes. Returns whether messages are pending.
    pub async fn wait(&self, name: &str, timeout: Duration) -> Result<bool, BrokerError> {
        let mailbox = self.mailbox(name).await?;
        if mailbox.len().await > 0 {
            return Ok(true);
        }
        // `notify_one` stores a permit, so an arrival between the check above
        // and this await is not lost.
        let _ = tokio::time::timeout(timeout, mailbox.arrivals.notified()).await;
        Ok(mailbox.len().await > 0)
    }
}
