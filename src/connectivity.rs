//! Network reachability monitor.
//!
//! Raw reachability reports are debounced: a change is committed only after
//! the signal stayed stable for the debounce window. Subscribers are notified
//! once per committed transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::notify::{Subscribers, Subscription};

struct Inner {
  online: AtomicBool,
  raw: watch::Sender<bool>,
  subscribers: Arc<Subscribers<bool>>,
  debounce: Duration,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
  /// Commit a state; returns whether it was a transition.
  fn commit(&self, online: bool) -> bool {
    let previous = self.online.swap(online, Ordering::SeqCst);
    if previous == online {
      return false;
    }

    if online {
      info!("Network: online");
    } else {
      warn!("Network: offline");
    }
    self.subscribers.notify(&online);
    true
  }
}

/// Shared handle to the process-wide connectivity state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool, debounce: Duration) -> Self {
    let (raw, _) = watch::channel(initially_online);
    Self {
      inner: Arc::new(Inner {
        online: AtomicBool::new(initially_online),
        raw,
        subscribers: Subscribers::new(),
        debounce,
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Register for committed transitions (`true` = back online).
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&bool) + Send + Sync + 'static,
  {
    self.inner.subscribers.subscribe(callback)
  }

  /// Commit a state immediately, bypassing the debounce window.
  pub fn set_online(&self, online: bool) -> bool {
    self.inner.raw.send_replace(online);
    self.inner.commit(online)
  }

  /// Feed a raw reachability observation through the debouncer.
  pub fn report(&self, reachable: bool) {
    self.inner.raw.send_replace(reachable);
  }

  /// Start the debouncer. Must be called inside a tokio runtime.
  pub fn start(&self) {
    let mut rx = self.inner.raw.subscribe();
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let debounce = self.inner.debounce;

    let handle = tokio::spawn(async move {
      loop {
        if rx.changed().await.is_err() {
          return;
        }

        // Wait until the signal has been quiet for the whole window
        loop {
          tokio::select! {
            _ = tokio::time::sleep(debounce) => break,
            changed = rx.changed() => {
              if changed.is_err() {
                return;
              }
            }
          }
        }

        let value = *rx.borrow_and_update();
        match weak.upgrade() {
          Some(inner) => {
            inner.commit(value);
          }
          None => return,
        }
      }
    });

    self.track(handle);
  }

  /// Periodically check the API and report what it finds.
  pub fn spawn_health_check(&self, client: ApiClient, interval: Duration) {
    let monitor = self.downgrade();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let reachable = client.is_reachable().await;
        match monitor.upgrade() {
          Some(monitor) => monitor.report(reachable),
          None => return,
        }
      }
    });

    self.track(handle);
  }

  /// Stop the debouncer and health-check tasks.
  pub fn dispose(&self) {
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      tasks.push(handle);
    }
  }

  fn downgrade(&self) -> WeakMonitor {
    WeakMonitor(Arc::downgrade(&self.inner))
  }
}

struct WeakMonitor(Weak<Inner>);

impl WeakMonitor {
  fn upgrade(&self) -> Option<ConnectivityMonitor> {
    self.0.upgrade().map(|inner| ConnectivityMonitor { inner })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counting(monitor: &ConnectivityMonitor) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<bool>>>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (count_clone, seen_clone) = (count.clone(), seen.clone());
    let _ = monitor.subscribe(move |online| {
      count_clone.fetch_add(1, Ordering::SeqCst);
      seen_clone.lock().unwrap().push(*online);
    });
    (count, seen)
  }

  #[test]
  fn test_set_online_notifies_once_per_transition() {
    let monitor = ConnectivityMonitor::new(true, Duration::ZERO);
    let (count, seen) = counting(&monitor);

    assert!(!monitor.set_online(true));
    assert!(monitor.set_online(false));
    assert!(!monitor.set_online(false));
    assert!(monitor.set_online(true));

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_throwing_subscriber_does_not_block_others() {
    let monitor = ConnectivityMonitor::new(true, Duration::ZERO);
    let _ = monitor.subscribe(|_| panic!("listener bug"));
    let (count, _) = counting(&monitor);

    monitor.set_online(false);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_flapping_is_debounced() {
    let monitor = ConnectivityMonitor::new(true, Duration::from_millis(50));
    monitor.start();
    let (count, seen) = counting(&monitor);

    monitor.report(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.report(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.report(false);

    // Still inside the window: nothing committed yet
    assert!(monitor.is_online());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!monitor.is_online());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), vec![false]);

    monitor.dispose();
  }

  #[tokio::test]
  async fn test_blip_back_to_same_state_is_ignored() {
    let monitor = ConnectivityMonitor::new(true, Duration::from_millis(30));
    monitor.start();
    let (count, _) = counting(&monitor);

    monitor.report(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    monitor.report(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(monitor.is_online());
    assert_eq!(count.load(Ordering::SeqCst), 0);
    monitor.dispose();
  }
}
