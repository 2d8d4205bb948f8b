//! In-process metric primitives: a registry of named instruments, each fanning
//! out to per-attribute-set observers.
//!
//! The expected flow is that a component registers a [`Metric`] once at
//! construction time, obtains one [`U64Counter`] (or gauge/histogram) recorder
//! per attribute set, and then updates those recorders on the hot path without
//! touching the registry again. Exposition (Prometheus et al.) is an external
//! concern that walks the registry.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    borrow::Cow,
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A set of key-value attributes qualifying an observation, e.g.
/// `{"trigger" => "idle"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Iterate over the attribute pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Cow<'static, str>)> {
        self.0.iter()
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(attributes: &[(&'static str, &'static str); N]) -> Self {
        Self::from(attributes.as_slice())
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(attributes: &[(&'static str, &'static str)]) -> Self {
        Self(
            attributes
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(attributes: [(&'static str, String); N]) -> Self {
        Self(
            attributes
                .into_iter()
                .map(|(k, v)| (k, Cow::Owned(v)))
                .collect(),
        )
    }
}

/// An observer records observations for a single attribute set.
///
/// Observers are cheap to clone; clones share state.
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {
    /// The value produced when this observer is read.
    type Observation: Debug + PartialEq;

    /// Read the current value.
    fn observe(&self) -> Self::Observation;
}

/// A named instrument fanning out to one observer per attribute set.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    /// Instrument name, e.g. `ingester_cut_count`.
    pub name: &'static str,
    /// Human description for exposition.
    pub description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// Return the recorder for the given attribute set, creating it on first
    /// use. Recorders share state with the registry.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Return the observer for the given attribute set, if any observation
    /// has been recorded for it.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }

    /// Snapshot `(attributes, observation)` pairs.
    pub fn observations(&self) -> Vec<(Attributes, T::Observation)> {
        self.observers
            .lock()
            .iter()
            .map(|(a, o)| (a.clone(), o.observe()))
            .collect()
    }
}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current count.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    type Observation = u64;

    fn observe(&self) -> u64 {
        self.fetch()
    }
}

/// A gauge holding the latest set value.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicU64>);

impl U64Gauge {
    /// Set the value.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increment by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    type Observation = u64;

    fn observe(&self) -> u64 {
        self.fetch()
    }
}

/// The aggregate observation of a [`DurationHistogram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationObservation {
    /// Number of samples recorded.
    pub sample_count: u64,
    /// Sum of all recorded durations.
    pub total: Duration,
}

#[derive(Debug, Default)]
struct DurationState {
    sample_count: u64,
    total: Duration,
}

/// Records a distribution of durations. Only count and sum are tracked;
/// bucketing is left to the exposition layer.
#[derive(Debug, Clone, Default)]
pub struct DurationHistogram(Arc<Mutex<DurationState>>);

impl DurationHistogram {
    /// Record one sample.
    pub fn record(&self, duration: Duration) {
        let mut state = self.0.lock();
        state.sample_count += 1;
        state.total += duration;
    }

    /// Read the aggregate observation.
    pub fn fetch(&self) -> DurationObservation {
        let state = self.0.lock();
        DurationObservation {
            sample_count: state.sample_count,
            total: state.total,
        }
    }
}

impl MetricObserver for DurationHistogram {
    type Observation = DurationObservation;

    fn observe(&self) -> DurationObservation {
        self.fetch()
    }
}

/// Holds all instruments of a process, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch the already-registered) instrument `name`.
    ///
    /// # Panics
    ///
    /// If `name` was previously registered with a different observer type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let boxed = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));

        boxed
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {name} registered with a different type"))
            .clone()
    }

    /// Look up an instrument by name.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|boxed| boxed.downcast_ref::<Metric<T>>())
            .cloned()
    }
}
