//! LockMaintainer: keeps re-acquiring the distributed lock and publishes
//! whether this node currently holds it.
//!
//! Losing the lock only flips the published flag. Singleton jobs watch the
//! flag and skip their work while it is `false`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::lock::DistributedLock;

pub struct LockMaintainer {
    lock: Arc<dyn DistributedLock>,
    owner: String,
    ttl: Duration,
    retry_interval: Duration,
    held: watch::Sender<bool>,
}

impl LockMaintainer {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        owner: impl Into<String>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            lock,
            owner: owner.into(),
            ttl,
            retry_interval,
            held,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Receiver of the "lock held" flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.held.subscribe()
    }

    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    /// One acquire-or-renew attempt. Returns whether the lock is held.
    pub async fn try_acquire(&self) -> bool {
        let was_held = self.is_held();
        let held = match self.lock.lock(&self.owner, self.ttl).await {
            Ok(true) => {
                if !was_held {
                    info!(owner = %self.owner, "distributed lock acquired");
                }
                true
            }
            Ok(false) => {
                if was_held {
                    warn!(owner = %self.owner, "distributed lock lost");
                } else {
                    debug!(owner = %self.owner, "distributed lock held by another node");
                }
                false
            }
            Err(e) => {
                error!(owner = %self.owner, error = %e, "distributed lock attempt failed");
                false
            }
        };
        self.held.send_replace(held);
        held
    }

    /// Run until shutdown, then release the lock if held.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.owner,
            ttl_secs = self.ttl.as_secs(),
            retry_ms = self.retry_interval.as_millis() as u64,
            "lock maintainer started"
        );

        loop {
            self.try_acquire().await;
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = shutdown.changed() => {
                    debug!(owner = %self.owner, "lock maintainer shutting down");
                    break;
                }
            }
        }

        if self.held.send_replace(false) {
            match self.lock.release(&self.owner).await {
                Ok(()) => info!(owner = %self.owner, "distributed lock released"),
                Err(e) => error!(owner = %self.owner, error = %e, "failed to release distributed lock"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::LockError;
    use crate::lock::LockFuture;

    /// In-process lock that can be flipped between free and taken.
    #[derive(Default)]
    struct FakeLock {
        taken_by_other: AtomicBool,
        holder: Mutex<Option<String>>,
        releases: Mutex<Vec<String>>,
    }

    impl DistributedLock for FakeLock {
        fn lock<'a>(&'a self, owner: &'a str, _ttl: Duration) -> LockFuture<'a, bool> {
            Box::pin(async move {
                let ok = !self.taken_by_other.load(Ordering::SeqCst);
                *self.holder.lock().unwrap() = ok.then(|| owner.to_string());
                Ok::<_, LockError>(ok)
            })
        }

        fn release<'a>(&'a self, owner: &'a str) -> LockFuture<'a, ()> {
            Box::pin(async move {
                self.releases.lock().unwrap().push(owner.to_string());
                *self.holder.lock().unwrap() = None;
                Ok::<_, LockError>(())
            })
        }
    }

    #[tokio::test]
    async fn publishes_held_and_lost() {
        let fake = Arc::new(FakeLock::default());
        let maintainer = LockMaintainer::new(
            fake.clone(),
            "node-a",
            Duration::from_secs(15),
            Duration::from_secs(5),
        );
        let rx = maintainer.subscribe();

        assert!(maintainer.try_acquire().await);
        assert!(*rx.borrow());

        fake.taken_by_other.store(true, Ordering::SeqCst);
        assert!(!maintainer.try_acquire().await);
        assert!(!*rx.borrow());
        assert!(!maintainer.is_held());
    }

    #[tokio::test]
    async fn releases_on_shutdown() {
        let fake = Arc::new(FakeLock::default());
        let maintainer = Arc::new(LockMaintainer::new(
            fake.clone(),
            "node-a",
            Duration::from_secs(15),
            Duration::from_millis(20),
        ));
        let mut held_rx = maintainer.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let maintainer = maintainer.clone();
            tokio::spawn(async move { maintainer.run(shutdown_rx).await })
        };

        held_rx.wait_for(|held| *held).await.unwrap();
        assert_eq!(fake.holder.lock().unwrap().as_deref(), Some("node-a"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(!maintainer.is_held());
        assert_eq!(*fake.releases.lock().unwrap(), vec!["node-a".to_string()]);
    }

    #[tokio::test]
    async fn no_release_when_never_held() {
        let fake = Arc::new(FakeLock::default());
        fake.taken_by_other.store(true, Ordering::SeqCst);
        let maintainer = LockMaintainer::new(
            fake.clone(),
            "node-b",
            Duration::from_secs(15),
            Duration::from_millis(20),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        maintainer.run(shutdown_rx).await;
        assert!(fake.releases.lock().unwrap().is_empty());
    }
}
