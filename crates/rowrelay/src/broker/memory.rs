// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker
//!
//! Queues live in a shared map behind a mutex; waiting consumers park on a
//! [`Notify`]. Deliveries taken in [`AckMode::AfterAppend`] stay in the
//! queue's unacked set until acknowledged, rejected, or the consumer is
//! dropped, in which case they go back to the head of the queue.
//!
//! [`MemoryBroker::disconnect`] simulates a broker outage: every call fails
//! with a connection error and unacked deliveries return to their queues,
//! until [`MemoryBroker::reconnect`]. Queues and their messages survive.

use super::{AckMode, Broker, BrokerError, Delivery, QueueConsumer};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    fail_publishes: usize,
    lose_acks: usize,
    closed: bool,
    down: bool,
}

impl BrokerState {
    /// Fail if the broker is shut down or unreachable.
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.down {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broker that keeps every queue in memory. Clones share queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Refuse the next `n` publishes without enqueuing them.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.lock().fail_publishes = n;
    }

    /// Enqueue the next `n` publishes but report them as unconfirmed,
    /// the way a connection drop after the broker stored the message does.
    pub fn lose_next_acks(&self, n: usize) {
        self.inner.lock().lose_acks = n;
    }

    /// Shut the broker down. Waiting consumers see the end of their stream.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Drop every connection. Unacked deliveries go back to the head of
    /// their queues, marked redelivered.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.down = true;
        for q in state.queues.values_mut() {
            let unacked = std::mem::take(&mut q.unacked);
            for (_, message) in unacked.into_iter().rev() {
                q.ready.push_front(Message {
                    payload: message.payload,
                    redelivered: true,
                });
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// End an outage started by [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.inner.lock().down = false;
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        state.check_open()?;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::Nack(format!("publish to '{}' refused", queue)));
        }

        let lost = state.lose_acks > 0;
        if lost {
            state.lose_acks -= 1;
        }

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        q.ready.push_back(Message {
            payload,
            redelivered: false,
        });
        drop(state);
        self.inner.notify.notify_waiters();

        if lost {
            return Err(BrokerError::Connection(
                "publisher confirm lost".to_string(),
            ));
        }
        Ok(())
    }
}

impl Broker for MemoryBroker {
    type Consumer = MemoryConsumer;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        state.check_open()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.enqueue(queue, payload)
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<MemoryConsumer, BrokerError> {
        let state = self.inner.lock();
        state.check_open()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        drop(state);

        Ok(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            mode,
            outstanding: BTreeSet::new(),
        })
    }
}

/// Subscription to one in-memory queue.
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    mode: AckMode,
    outstanding: BTreeSet<u64>,
}

impl MemoryConsumer {
    /// Pop the head of the queue. `Ok(None)` means the queue is empty.
    fn try_take(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.check_open()?;

        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        if self.mode == AckMode::AfterAppend {
            q.unacked.insert(tag, message);
            self.outstanding.insert(tag);
        }
        Ok(Some(delivery))
    }

    fn settle(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        if self.mode == AckMode::Auto {
            return Ok(());
        }
        if !self.outstanding.remove(&tag) {
            return Err(BrokerError::UnknownDelivery(tag));
        }

        let mut state = self.inner.lock();
        state.check_open()?;
        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;
        let message = q
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;

        if requeue {
            q.ready.push_front(Message {
                payload: message.payload,
                redelivered: true,
            });
            drop(state);
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }
}

impl QueueConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let inner = Arc::clone(&self.inner);
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => {}
                Err(BrokerError::Closed) => return None,
                Err(e) => return Some(Err(e)),
            }

            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.settle(tag, false)
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.settle(tag, requeue)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }

        let mut state = self.inner.lock();
        if let Some(q) = state.queues.get_mut(&self.queue) {
            for tag in self.outstanding.iter().rev() {
                if let Some(message) = q.unacked.remove(tag) {
                    q.ready.push_front(Message {
                        payload: message.payload,
                        redelivered: true,
                    });
                }
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with_queue() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = broker_with_queue().await;
        broker.publish("q", b"one".to_vec()).await.unwrap();
        broker.publish("q", b"two".to_vec()).await.unwrap();

        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();
        let first = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("q"), 1);

        consumer.ack(first.tag).await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert!(matches!(
            consumer.ack(first.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));

        let second = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("missing", Vec::new()).await,
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers_first() {
        let broker = broker_with_queue().await;
        broker.publish("q", b"a".to_vec()).await.unwrap();
        broker.publish("q", b"b".to_vec()).await.unwrap();

        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();
        let a = consumer.next_delivery().await.unwrap().unwrap();
        consumer.reject(a.tag, true).await.unwrap();

        let again = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);

        consumer.reject(again.tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_dropped_consumer_returns_unacked_in_order() {
        let broker = broker_with_queue().await;
        for payload in [b"1", b"2", b"3"] {
            broker.publish("q", payload.to_vec()).await.unwrap();
        }

        {
            let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();
            consumer.next_delivery().await.unwrap().unwrap();
            consumer.next_delivery().await.unwrap().unwrap();
        }
        assert_eq!(broker.queue_depth("q"), 3);

        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();
        let mut order = Vec::new();
        for _ in 0..3 {
            let d = consumer.next_delivery().await.unwrap().unwrap();
            order.push((d.payload, d.redelivered));
        }
        assert_eq!(
            order,
            vec![
                (b"1".to_vec(), true),
                (b"2".to_vec(), true),
                (b"3".to_vec(), false)
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_mode_does_not_track_deliveries() {
        let broker = broker_with_queue().await;
        broker.publish("q", b"x".to_vec()).await.unwrap();

        {
            let mut consumer = broker.consume("q", AckMode::Auto).await.unwrap();
            let d = consumer.next_delivery().await.unwrap().unwrap();
            assert_eq!(broker.unacked_count("q"), 0);
            consumer.ack(d.tag).await.unwrap();
        }
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = broker_with_queue().await;

        broker.fail_next_publishes(1);
        assert!(matches!(
            broker.publish("q", b"refused".to_vec()).await,
            Err(BrokerError::Nack(_))
        ));
        assert_eq!(broker.queue_depth("q"), 0);

        broker.lose_next_acks(1);
        assert!(matches!(
            broker.publish("q", b"stored".to_vec()).await,
            Err(BrokerError::Connection(_))
        ));
        assert_eq!(broker.queue_depth("q"), 1);

        broker.publish("q", b"ok".to_vec()).await.unwrap();
        assert_eq!(broker.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn test_outage_requeues_unacked_and_consumer_resumes() {
        let broker = broker_with_queue().await;
        broker.publish("q", b"a".to_vec()).await.unwrap();
        broker.publish("q", b"b".to_vec()).await.unwrap();

        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();
        let a = consumer.next_delivery().await.unwrap().unwrap();

        broker.disconnect();
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.queue_depth("q"), 2);
        assert!(matches!(
            consumer.next_delivery().await,
            Some(Err(BrokerError::Connection(_)))
        ));
        assert!(matches!(
            broker.publish("q", b"c".to_vec()).await,
            Err(BrokerError::Connection(_))
        ));
        assert!(consumer.ack(a.tag).await.is_err());

        broker.reconnect();
        let again = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
        consumer.ack(again.tag).await.unwrap();

        // A tag from before the outage is gone for good
        assert!(matches!(
            consumer.ack(a.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));

        let b = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(b.payload, b"b");
        assert!(!b.redelivered);
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_outage() {
        let broker = broker_with_queue().await;
        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();

        let outage = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            outage.disconnect();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
            .await
            .unwrap();
        assert!(matches!(next, Some(Err(BrokerError::Connection(_)))));
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish_and_close() {
        let broker = broker_with_queue().await;
        let mut consumer = broker.consume("q", AckMode::AfterAppend).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.close();
        });

        let d = tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(d.payload, b"late");

        let end = tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
