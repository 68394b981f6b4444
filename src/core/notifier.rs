//! Per-budget fan-out of change events to connected clients.
//!
//! Each subscriber owns a bounded channel. Broadcasting never waits: a subscriber whose buffer
//! is full (or whose receiver is gone) is removed from the registry, which closes its stream.

use crate::core::errors::BudgetError;
use crate::core::models::event::{ChangeEvent, UpdatePayload};
use futures::Stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SubscriberMap = HashMap<i64, HashMap<u64, mpsc::Sender<ChangeEvent>>>;

struct Registry {
    subscribers: Mutex<SubscriberMap>,
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
    next_id: AtomicU64,
    buffer: usize,
}

impl Registry {
    fn subscribers(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remove(&self, budget_id: i64, subscriber_id: u64) {
        let mut subscribers = self.subscribers();
        if let Some(set) = subscribers.get_mut(&budget_id) {
            set.remove(&subscriber_id);
            if set.is_empty() {
                subscribers.remove(&budget_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct ChangeNotifier {
    registry: Arc<Registry>,
}

impl ChangeNotifier {
    /// Creates a stopped notifier; call [`ChangeNotifier::start`] before subscribing.
    pub fn new(buffer: usize) -> Self {
        ChangeNotifier {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                shutdown: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn start(&self) {
        let mut shutdown = self
            .registry
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
        }
        self.registry.running.store(true, Ordering::SeqCst);
        info!("Change notifier started");
    }

    /// Ends every open subscription and refuses new ones until restarted.
    pub fn stop(&self) {
        self.registry.running.store(false, Ordering::SeqCst);
        self.registry.shutdown_token().cancel();
        let dropped: usize = {
            let mut subscribers = self.registry.subscribers();
            let count = subscribers.values().map(HashMap::len).sum();
            subscribers.clear();
            count
        };
        info!("Change notifier stopped, {} subscriber(s) closed", dropped);
    }

    pub fn is_running(&self) -> bool {
        self.registry.running.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, budget_id: i64) -> usize {
        self.registry
            .subscribers()
            .get(&budget_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Registers a subscriber for `budget_id`. Callers verify the identity and membership first.
    pub fn subscribe(&self, budget_id: i64) -> Result<Subscription, BudgetError> {
        if !self.is_running() {
            return Err(BudgetError::InternalServerError(
                "Change notifier is not running".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(self.registry.buffer);
        // Fresh channel with capacity >= 1, the greeting always fits.
        let _ = tx.try_send(ChangeEvent::Hello);
        let subscriber_id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry
            .subscribers()
            .entry(budget_id)
            .or_default()
            .insert(subscriber_id, tx);
        debug!("Subscriber {} joined budget {}", subscriber_id, budget_id);
        Ok(Subscription {
            budget_id,
            subscriber_id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
            shutdown: self.registry.shutdown_token(),
        })
    }

    /// Delivers `payload` to every subscriber of its budget and returns how many accepted it.
    pub fn broadcast(&self, payload: UpdatePayload) -> usize {
        let budget_id = payload.budget_id;
        let event = ChangeEvent::Update(payload);
        let mut subscribers = self.registry.subscribers();
        let Some(set) = subscribers.get_mut(&budget_id) else {
            return 0;
        };

        let mut delivered = 0;
        set.retain(|subscriber_id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Dropping slow subscriber {} of budget {}",
                    subscriber_id, budget_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if set.is_empty() {
            subscribers.remove(&budget_id);
        }
        debug!("Broadcast {} to {} subscriber(s) of budget {}", event.name(), delivered, budget_id);
        delivered
    }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
    budget_id: i64,
    subscriber_id: u64,
    receiver: mpsc::Receiver<ChangeEvent>,
    registry: Weak<Registry>,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn budget_id(&self) -> i64 {
        self.budget_id
    }

    /// Next event, or `None` once the notifier stops or this subscriber was dropped as slow.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Event stream interleaved with a `ping` keepalive every `ping_every`.
    pub fn into_stream(self, ping_every: Duration) -> impl Stream<Item = ChangeEvent> + Send + 'static {
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        futures::stream::unfold((self, ticker), |(mut subscription, mut ticker)| async move {
            let next = tokio::select! {
                biased;
                event = subscription.recv() => event,
                _ = ticker.tick() => Some(ChangeEvent::Ping),
            };
            next.map(|event| (event, (subscription, ticker)))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.budget_id, self.subscriber_id);
            debug!("Subscriber {} left budget {}", self.subscriber_id, self.budget_id);
        }
    }
}
