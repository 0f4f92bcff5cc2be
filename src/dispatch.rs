//! Event validation and fan-out.
//!
//! The dispatcher validates raw payloads, keeps per-key listener lists in
//! registration order, and escalates high/critical-priority records to a
//! side channel. Listener faults are contained: a panicking listener is
//! logged and never blocks delivery to the listeners after it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{EventRecord, Priority};

/// Listener invoked with each matching record.
pub type Listener = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// How a listener is matched against incoming records.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum SubscriptionKey {
    /// Match records with exactly this event type.
    Exact(String),
    /// Match every valid record.
    Wildcard,
    /// Match records whose metadata carries this category.
    Category(String),
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum Slot {
    Keyed(SubscriptionKey),
    HighPriority,
}

/// Opaque handle identifying one registration; used to unsubscribe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionHandle {
    slot: Slot,
    id: u64,
}

/// Outcome of the external notification-permission acquisition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertPermission {
    Granted,
    Denied,
}

/// External user-facing alert collaborator for critical records.
///
/// The dispatcher only checks or acquires permission through this trait; it
/// never assumes a grant.
pub trait AlertSink: Send + Sync {
    fn request_permission(&self) -> AlertPermission;
    fn alert(&self, record: &EventRecord);
}

struct Entry {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    keyed: HashMap<SubscriptionKey, Vec<Entry>>,
    high_priority: Vec<Entry>,
}

impl Table {
    fn register(&mut self, slot: Slot, listener: Listener) -> SubscriptionHandle {
        let id = self.next_id;
        self.next_id += 1;
        let entry = Entry { id, listener };
        match &slot {
            Slot::Keyed(key) => self.keyed.entry(key.clone()).or_default().push(entry),
            Slot::HighPriority => self.high_priority.push(entry),
        }
        SubscriptionHandle { slot, id }
    }

    fn remove(&mut self, handle: &SubscriptionHandle) {
        match &handle.slot {
            Slot::Keyed(key) => {
                if let Some(entries) = self.keyed.get_mut(key) {
                    entries.retain(|entry| entry.id != handle.id);
                    if entries.is_empty() {
                        self.keyed.remove(key);
                    }
                }
            }
            Slot::HighPriority => {
                self.high_priority.retain(|entry| entry.id != handle.id);
            }
        }
    }

    fn listeners_for(&self, key: &SubscriptionKey) -> Vec<Listener> {
        self.keyed
            .get(key)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
            .unwrap_or_default()
    }
}

/// Validates decoded records and fans them out to subscribers.
pub struct EventDispatcher {
    table: RwLock<Table>,
    event_count: AtomicU64,
    // Unix millis of the last dispatched record; 0 means never.
    last_event_ms: AtomicU64,
    alerts: Option<Box<dyn AlertSink>>,
    permission: RwLock<Option<AlertPermission>>,
}

impl EventDispatcher {
    /// Creates a dispatcher without a critical-alert side channel.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            event_count: AtomicU64::new(0),
            last_event_ms: AtomicU64::new(0),
            alerts: None,
            permission: RwLock::new(None),
        }
    }

    /// Creates a dispatcher that escalates critical records to `sink`.
    pub fn with_alert_sink(sink: impl AlertSink + 'static) -> Self {
        Self {
            alerts: Some(Box::new(sink)),
            ..Self::new()
        }
    }

    /// Registers a listener for the given key; returns its handle.
    pub fn on(&self, key: SubscriptionKey, listener: Listener) -> SubscriptionHandle {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(Slot::Keyed(key), listener)
    }

    /// Registers a listener for an exact event type.
    pub fn on_type(
        &self,
        event_type: impl Into<String>,
        listener: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.on(SubscriptionKey::Exact(event_type.into()), Arc::new(listener))
    }

    /// Registers a wildcard listener invoked for every valid record.
    pub fn on_any(
        &self,
        listener: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.on(SubscriptionKey::Wildcard, Arc::new(listener))
    }

    /// Registers a listener for records carrying the given category.
    pub fn on_category(
        &self,
        category: impl Into<String>,
        listener: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.on(SubscriptionKey::Category(category.into()), Arc::new(listener))
    }

    /// Registers a listener on the high/critical-priority path, which runs
    /// before ordinary delivery.
    pub fn on_high_priority(
        &self,
        listener: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(Slot::HighPriority, Arc::new(listener))
    }

    /// Removes a registration. Idempotent: removing twice is a no-op.
    pub fn off(&self, handle: &SubscriptionHandle) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
    }

    /// Total number of active registrations, all paths included.
    pub fn subscriber_count(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.keyed.values().map(Vec::len).sum::<usize>() + table.high_priority.len()
    }

    /// Acquires alert permission through the sink and caches the outcome.
    ///
    /// Without a sink this reports `Denied`: critical records then skip the
    /// side channel but still reach ordinary listeners.
    pub fn request_alert_permission(&self) -> AlertPermission {
        let outcome = match self.alerts.as_ref() {
            Some(sink) => sink.request_permission(),
            None => AlertPermission::Denied,
        };
        *self
            .permission
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        outcome
    }

    /// Last acquired alert permission, if any acquisition has happened.
    pub fn alert_permission(&self) -> Option<AlertPermission> {
        *self
            .permission
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of records dispatched since construction.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Unix millis of the most recently dispatched record.
    pub fn last_event_time_ms(&self) -> Option<u64> {
        match self.last_event_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Validates a raw payload and delivers it.
    ///
    /// Invalid records are logged and dropped; zero listeners are called.
    pub fn dispatch(&self, raw: Value) {
        match EventRecord::from_value(raw) {
            Ok(record) => self.dispatch_record(&record),
            Err(err) => {
                warn!(event = "record_rejected", error = %err);
            }
        }
    }

    /// Delivers an already-validated record.
    ///
    /// Delivery order: high-priority path (for high/critical records), then
    /// exact-type listeners, wildcard listeners, and category listeners, each
    /// in registration order.
    pub fn dispatch_record(&self, record: &EventRecord) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms
            .store(Utc::now().timestamp_millis().max(1) as u64, Ordering::Relaxed);

        let priority = record.priority();

        // Snapshot listener lists so a listener may subscribe/unsubscribe
        // without deadlocking against the table lock.
        let (high, exact, wildcard, category) = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            let high: Vec<Listener> = if priority.is_elevated() {
                table
                    .high_priority
                    .iter()
                    .map(|e| Arc::clone(&e.listener))
                    .collect()
            } else {
                Vec::new()
            };
            let exact =
                table.listeners_for(&SubscriptionKey::Exact(record.event_type.clone()));
            let wildcard = table.listeners_for(&SubscriptionKey::Wildcard);
            let category = record
                .category()
                .map(|name| table.listeners_for(&SubscriptionKey::Category(name.to_string())))
                .unwrap_or_default();
            (high, exact, wildcard, category)
        };

        if priority == Priority::Critical {
            self.trigger_alert(record);
        }

        for listener in high
            .iter()
            .chain(exact.iter())
            .chain(wildcard.iter())
            .chain(category.iter())
        {
            invoke_listener(listener, record);
        }
    }

    fn trigger_alert(&self, record: &EventRecord) {
        let Some(sink) = self.alerts.as_ref() else {
            return;
        };
        match self.alert_permission() {
            Some(AlertPermission::Granted) => sink.alert(record),
            Some(AlertPermission::Denied) => {
                debug!(event = "critical_alert_suppressed", reason = "permission denied");
            }
            None => {
                debug!(event = "critical_alert_suppressed", reason = "permission not acquired");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke_listener(listener: &Listener, record: &EventRecord) {
    let outcome = catch_unwind(AssertUnwindSafe(|| listener(record)));
    if outcome.is_err() {
        warn!(
            event = "listener_panicked",
            record_id = %record.id,
            record_type = %record.event_type
        );
    }
}
