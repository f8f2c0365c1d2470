//! Live matcher settings.
//!
//! The value itself travels on a `watch` channel: the SIGHUP handler
//! replaces it, the matcher's run loop wakes on the change and re-reads the
//! interval, and every scan clones the current value once at its start.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to the current value of type `T`.
pub struct ConfigStore<T> {
    tx: Arc<watch::Sender<T>>,
}

/// Wakes up when the [`ConfigStore`] it came from is updated.
pub struct ConfigWatcher<T> {
    rx: watch::Receiver<T>,
}

impl<T> ConfigStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Swap in a new value and wake every watcher.
    pub fn update(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn subscribe(&self) -> ConfigWatcher<T> {
        ConfigWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> ConfigStore<T> {
    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> ConfigWatcher<T> {
    /// Resolves after the next update. Errors once every store handle is
    /// dropped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_wakes_watchers() {
        let store = ConfigStore::new(1u32);
        let mut watcher = store.subscribe();

        store.clone().update(2);
        watcher.changed().await.unwrap();

        assert_eq!(store.get(), 2);
    }

    #[tokio::test]
    async fn test_watcher_errors_after_store_dropped() {
        let store = ConfigStore::new(());
        let mut watcher = store.subscribe();
        drop(store);
        assert!(watcher.changed().await.is_err());
    }
}
