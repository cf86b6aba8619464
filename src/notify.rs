//! Subscriber registry shared by every observable component.
//!
//! Callbacks run synchronously on the notifying task. A panicking callback is
//! logged and skipped; the remaining subscribers are still notified.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

trait Unsubscribe: Send + Sync {
  fn remove(&self, id: u64);
}

/// List of callbacks interested in values of type `T`.
pub struct Subscribers<T> {
  next_id: AtomicU64,
  callbacks: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T: 'static> Subscribers<T> {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      next_id: AtomicU64::new(1),
      callbacks: Mutex::new(Vec::new()),
    })
  }

  /// Register a callback. It stays registered until `unsubscribe` is called.
  pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut callbacks) = self.callbacks.lock() {
      callbacks.push((id, Arc::new(callback)));
    }

    let registry: Arc<dyn Unsubscribe> = self.clone();
    Subscription {
      id,
      registry: Arc::downgrade(&registry),
    }
  }

  /// Call every subscriber with `value`.
  pub fn notify(&self, value: &T) {
    // Snapshot so callbacks may (un)subscribe without deadlocking
    let callbacks: Vec<Callback<T>> = match self.callbacks.lock() {
      Ok(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
      Err(_) => return,
    };

    for callback in callbacks {
      if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("Subscriber panicked while handling a notification");
      }
    }
  }

  pub fn len(&self) -> usize {
    self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T: 'static> Unsubscribe for Subscribers<T> {
  fn remove(&self, id: u64) {
    if let Ok(mut callbacks) = self.callbacks.lock() {
      callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
  }
}

/// Handle returned by `subscribe`.
#[derive(Clone)]
pub struct Subscription {
  id: u64,
  registry: Weak<dyn Unsubscribe>,
}

impl Subscription {
  /// Stop receiving notifications. Safe to call after the source is gone.
  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.remove(self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn test_notify_reaches_all_subscribers() {
    let subscribers = Subscribers::<u32>::new();
    let total = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      let total = total.clone();
      let _ = subscribers.subscribe(move |v| {
        total.fetch_add(*v as usize, Ordering::SeqCst);
      });
    }

    subscribers.notify(&2);
    assert_eq!(total.load(Ordering::SeqCst), 6);
  }

  #[test]
  fn test_unsubscribe_stops_notifications() {
    let subscribers = Subscribers::<()>::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    let subscription = subscribers.subscribe(move |_| {
      hits_clone.fetch_add(1, Ordering::SeqCst);
    });
    subscribers.notify(&());
    subscription.unsubscribe();
    subscribers.notify(&());

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(subscribers.is_empty());
  }

  #[test]
  fn test_panicking_subscriber_is_isolated() {
    let subscribers = Subscribers::<bool>::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let _ = subscribers.subscribe(|_| panic!("boom"));
    let hits_clone = hits.clone();
    let _ = subscribers.subscribe(move |_| {
      hits_clone.fetch_add(1, Ordering::SeqCst);
    });

    subscribers.notify(&true);
    subscribers.notify(&false);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_unsubscribe_after_drop_is_harmless() {
    let subscribers = Subscribers::<u8>::new();
    let subscription = subscribers.subscribe(|_| {});
    drop(subscribers);
    subscription.unsubscribe();
  }
}
