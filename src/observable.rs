//! Component A — the observable substrate.
//!
//! Every device, channel, and derived observable is a *producer*: something
//! that emits timestamped key→value samples. This module holds the
//! append-only per-producer history and the subscribe/update/query surface
//! built on top of it.
//!
//! Grounded on the broadcast/handle subscribe pattern in the teacher's
//! `core.rs`/`app_actor.rs`, but expressed as an explicit subscriber list
//! rather than a `tokio::sync::broadcast` channel: unsubscribe needs to be
//! identity-based and idempotent, and the condition handler (component H)
//! needs a re-entrancy guard that a broadcast channel can't give us.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single observed value. Devices report both numeric and textual
/// readings on the wire, so this stays a simple two-variant enum rather
/// than forcing everything through `f64`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// Numeric view used by conditions/derived observables; non-numeric
    /// values contribute nothing (per spec.md §4.I, "non-numeric values
    /// contribute zero").
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// One entry in a producer's append-only history.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

#[derive(Debug, Error, PartialEq)]
pub enum ObservableError {
    #[error("no samples recorded for '{0}'")]
    NotFound(String),
}

/// Append-only history for a single variable name, kept in monotonically
/// non-decreasing timestamp order (spec.md §3 invariant).
#[derive(Debug, Default, Clone)]
struct History {
    samples: Vec<Sample>,
}

impl History {
    fn push(&mut self, sample: Sample) {
        debug_assert!(
            self.samples
                .last()
                .map_or(true, |last| last.timestamp <= sample.timestamp),
            "observable history must stay monotone non-decreasing"
        );
        self.samples.push(sample);
    }

    fn in_window(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Vec<Sample> {
        self.samples
            .iter()
            .filter(|s| from.map_or(true, |f| s.timestamp > f))
            .filter(|s| to.map_or(true, |t| s.timestamp <= t))
            .cloned()
            .collect()
    }

    fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }
}

/// A callback invoked once per updated key, in the order `update` iterates
/// its argument map. Subscribers are compared by `Arc` pointer identity so
/// `unsubscribe` can find the exact registration to remove.
pub trait Subscriber: Send + Sync {
    fn notify(&self, producer: &str, name: &str, sample: &Sample);
}

impl<F> Subscriber for F
where
    F: Fn(&str, &str, &Sample) + Send + Sync,
{
    fn notify(&self, producer: &str, name: &str, sample: &Sample) {
        (self)(producer, name, sample)
    }
}

/// The pub-sub substrate. One `ObservableBus` instance is shared by a
/// device and every derived observable and condition that watches it; the
/// `producer` string is the name this bus publishes under (a device name,
/// a channel's qualified name, or a derived observable's name).
pub struct ObservableBus {
    producer: String,
    histories: HashMap<String, History>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl ObservableBus {
    #[must_use]
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            histories: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    #[must_use]
    pub fn producer_name(&self) -> &str {
        &self.producer
    }

    /// Registers a subscriber. Re-subscribing the same `Arc` results in two
    /// notifications per update, matching a plain append-only list; callers
    /// that want single delivery must `unsubscribe` first.
    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Removes a subscriber by pointer identity. Idempotent: unsubscribing
    /// an absent subscriber is a no-op (spec.md §4.A).
    pub fn unsubscribe(&mut self, subscriber: &Arc<dyn Subscriber>) {
        self.subscribers
            .retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes one sample per key in `updates`, in the order the caller
    /// provides (spec.md requires dictionary iteration order; we use a
    /// `Vec` of pairs so callers control that order explicitly). Every
    /// subscriber is notified once per key, in subscription order.
    pub fn update(&mut self, updates: Vec<(String, Value)>, timestamp: DateTime<Utc>) {
        for (name, value) in updates {
            let sample = Sample { timestamp, value };
            self.histories
                .entry(name.clone())
                .or_default()
                .push(sample.clone());
            for subscriber in &self.subscribers {
                subscriber.notify(&self.producer, &name, &sample);
            }
        }
    }

    /// Convenience for a single key/value update at `Utc::now()`. Per Open
    /// Question (a), the timestamp always defaults at the call site, never
    /// a bound default parameter.
    pub fn update_one(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.update(vec![(name.into(), value.into())], Utc::now());
    }

    #[must_use]
    pub fn get_updates(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Sample> {
        self.histories
            .get(name)
            .map(|h| h.in_window(from, to))
            .unwrap_or_default()
    }

    pub fn get_latest(&self, name: &str) -> Result<Sample, ObservableError> {
        self.histories
            .get(name)
            .and_then(History::latest)
            .cloned()
            .ok_or_else(|| ObservableError::NotFound(name.to_string()))
    }
}
