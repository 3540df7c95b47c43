use crate::aggregator::Aggregator;
use crate::metrics::Metrics;
use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Push subscribers keyed by connection id. Each has a bounded outbound
/// queue; a subscriber that falls behind is dropped, never waited on.
pub struct Subscribers {
    connections: RwLock<HashMap<Uuid, mpsc::Sender<Message>>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl Subscribers {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            metrics,
        })
    }

    pub async fn add(&self) -> (Uuid, mpsc::Receiver<Message>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut conns = self.connections.write().await;
        conns.insert(id, tx);
        self.metrics.set_stream_subscribers(conns.len());
        (id, rx)
    }

    pub async fn remove(&self, id: &Uuid) {
        let mut conns = self.connections.write().await;
        conns.remove(id);
        self.metrics.set_stream_subscribers(conns.len());
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queues `payload` for every subscriber. Returns how many received it.
    pub async fn broadcast(&self, payload: &str) -> usize {
        let mut stale = Vec::new();
        let mut delivered = 0;
        {
            let conns = self.connections.read().await;
            for (id, tx) in conns.iter() {
                match tx.try_send(Message::Text(payload.to_string())) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(conn_id = %id, "очередь подписчика переполнена, отключаем");
                        stale.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }

        if !stale.is_empty() {
            let mut conns = self.connections.write().await;
            for id in &stale {
                // Dropping the sender ends the connection's writer loop.
                conns.remove(id);
            }
            self.metrics.set_stream_subscribers(conns.len());
            self.metrics.inc_stream_dropped(stale.len());
        }
        self.metrics.inc_stream_messages(delivered);
        delivered
    }

    /// Sends a Close frame where there is room and forgets every subscriber.
    pub async fn close_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for tx in conns.values() {
            let _ = tx.try_send(Message::Close(None));
        }
        conns.clear();
        self.metrics.set_stream_subscribers(0);
        info!(count, "все push-подписчики отключены");
    }
}

/// Polls on every tick and fans the serialized snapshot out to subscribers.
/// Ticks with no subscribers skip the poll.
pub async fn run_broadcaster(
    aggregator: Arc<Aggregator>,
    subscribers: Arc<Subscribers>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки рассылки");
                break;
            }
            _ = ticker.tick() => {
                if subscribers.count().await == 0 {
                    continue;
                }
                let snapshot = match aggregator.poll().await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        error!(error = %err, "опрос для рассылки не удался");
                        continue;
                    }
                };
                match serde_json::to_string(&*snapshot) {
                    Ok(json) => {
                        let delivered = subscribers.broadcast(&json).await;
                        debug!(delivered, "снимок разослан подписчикам");
                    }
                    Err(err) => error!(error = %err, "не удалось сериализовать снимок"),
                }
            }
        }
    }

    subscribers.close_all().await;
}
