//! Single-flight registry: concurrent requests for the same sample share one
//! resolution instead of each hitting the network or disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use peercache_core::types::SampleName;

type FlightMap<T> = HashMap<SampleName, watch::Receiver<Option<T>>>;

/// Outcome of [`InflightRegistry::begin`]: exactly one caller per name holds
/// the [`LeaderGuard`] at a time, everyone else gets a receiver to wait on.
pub enum Flight<T> {
    Leader(LeaderGuard<T>),
    Follower(watch::Receiver<Option<T>>),
}

#[derive(Debug)]
pub struct InflightRegistry<T> {
    flights: Arc<Mutex<FlightMap<T>>>,
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone> InflightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins or opens the flight for `name`.
    pub fn begin(&self, name: &SampleName) -> Flight<T> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = flights.get(name) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(name.clone(), rx);
        Flight::Leader(LeaderGuard {
            flights: self.flights.clone(),
            name: name.clone(),
            tx: Some(tx),
        })
    }

    /// Waits for the leader's published value. `None` means the leader went
    /// away without publishing; the caller should race for leadership again.
    pub async fn wait(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
        match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive right to resolve one sample's flight. Dropping the guard
/// without [`finish`](LeaderGuard::finish) aborts the flight and wakes
/// followers empty-handed.
pub struct LeaderGuard<T> {
    flights: Arc<Mutex<FlightMap<T>>>,
    name: SampleName,
    tx: Option<watch::Sender<Option<T>>>,
}

impl<T> LeaderGuard<T> {
    pub fn name(&self) -> &SampleName {
        &self.name
    }

    /// Publishes `value` to every follower and retires the flight.
    pub fn finish(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(value));
        }
    }
}

impl<T> Drop for LeaderGuard<T> {
    fn drop(&mut self) {
        self.tx.take();
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        flights.remove(&self.name);
    }
}
