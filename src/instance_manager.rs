use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    group_key::TestCaseGroupKey,
    sapi::{lock, CrashReport, SapiInstance, WebServerManager},
};

type Slot = Arc<AsyncMutex<Option<Arc<dyn SapiInstance>>>>;

/// Outcome of asking for an instance.
pub enum Acquired {
    Ready(InstanceLease),
    Crashed(CrashReport),
}

/// Access to an instance for one test.
///
/// For SAPIs without concurrent instances the lease keeps other workers out
/// until it is dropped. Pooled instances may be leased by several workers at once.
pub struct InstanceLease {
    instance: Arc<dyn SapiInstance>,
    _guard: Option<OwnedMutexGuard<Option<Arc<dyn SapiInstance>>>>,
}

impl InstanceLease {
    pub fn instance(&self) -> &dyn SapiInstance {
        self.instance.as_ref()
    }
}

enum Slots {
    /// One instance at a time, replaced whenever another key is requested.
    Single(Slot),
    /// One slot per key, up to `capacity` idle instances.
    Pool {
        slots: Mutex<IndexMap<TestCaseGroupKey, Slot>>,
        capacity: usize,
    },
}

/// Owns the SAPI instances of one scenario set, keyed by group key.
pub struct SharedInstanceManager {
    manager: Arc<dyn WebServerManager>,
    slots: Slots,
}

impl SharedInstanceManager {
    pub fn new(manager: Arc<dyn WebServerManager>, capacity: usize) -> Self {
        let slots = if manager.allow_concurrent_instances() {
            Slots::Pool {
                slots: Mutex::new(IndexMap::new()),
                capacity: capacity.max(1),
            }
        } else {
            Slots::Single(Arc::new(AsyncMutex::new(None)))
        };
        Self { manager, slots }
    }

    /// Returns a healthy instance configured for `key`, spawning one if needed.
    pub async fn acquire(&self, key: &TestCaseGroupKey) -> Acquired {
        match &self.slots {
            Slots::Single(slot) => {
                let mut guard = slot.clone().lock_owned().await;
                match self.reuse_or_spawn(&mut guard, key).await {
                    Ok(instance) => Acquired::Ready(InstanceLease {
                        instance,
                        _guard: Some(guard),
                    }),
                    Err(report) => Acquired::Crashed(report),
                }
            }
            Slots::Pool { .. } => {
                let (slot, evicted) = self.pool_slot(key);
                for instance in evicted {
                    tracing::debug!(address = %instance.address(), "evicting idle SAPI instance");
                    instance.close().await;
                }

                // holding the slot serializes health checks and spawns per key
                let mut guard = slot.lock().await;
                match self.reuse_or_spawn(&mut guard, key).await {
                    Ok(instance) => Acquired::Ready(InstanceLease {
                        instance,
                        _guard: None,
                    }),
                    Err(report) => Acquired::Crashed(report),
                }
            }
        }
    }

    async fn reuse_or_spawn(
        &self,
        current: &mut Option<Arc<dyn SapiInstance>>,
        key: &TestCaseGroupKey,
    ) -> Result<Arc<dyn SapiInstance>, CrashReport> {
        if let Some(instance) = current.take() {
            if instance.key() == key && instance.is_running().await {
                tracing::debug!(address = %instance.address(), "reusing SAPI instance");
                *current = Some(instance.clone());
                return Ok(instance);
            }
            if instance.is_crashed() {
                tracing::warn!(address = %instance.address(), "replacing crashed SAPI instance");
            }
            instance.close().await;
        }

        let instance = self
            .manager
            .get_instance(key, self.manager.default_docroot())
            .await?;
        tracing::info!(
            sapi = %self.manager.name(),
            address = %instance.address(),
            "spawned SAPI instance"
        );
        *current = Some(instance.clone());
        Ok(instance)
    }

    /// Finds or creates the slot for `key`, evicting idle instances over capacity.
    fn pool_slot(&self, key: &TestCaseGroupKey) -> (Slot, Vec<Arc<dyn SapiInstance>>) {
        let Slots::Pool { slots, capacity } = &self.slots else {
            unreachable!("pool_slot is only used in pool mode")
        };
        let mut slots = lock(slots);
        if let Some(slot) = slots.get(key) {
            return (slot.clone(), vec![]);
        }

        let mut evicted = vec![];
        let mut i = 0;
        while slots.len() >= *capacity && i < slots.len() {
            // a slot handed out by an earlier call may not be locked yet
            if Arc::strong_count(&slots[i]) > 1 {
                i += 1;
                continue;
            }
            let idle = slots[i].try_lock().ok().and_then(|mut current| {
                // a lease still in use holds a second reference
                match current.as_ref() {
                    Some(instance) if Arc::strong_count(instance) > 1 => None,
                    _ => Some(current.take()),
                }
            });
            match idle {
                Some(instance) => {
                    slots.shift_remove_index(i);
                    evicted.extend(instance);
                }
                None => i += 1,
            }
        }

        let slot: Slot = Arc::new(AsyncMutex::new(None));
        slots.insert(key.clone(), slot.clone());
        (slot, evicted)
    }

    /// Closes every owned instance.
    pub async fn release_all(&self) {
        let slots = match &self.slots {
            Slots::Single(slot) => vec![slot.clone()],
            Slots::Pool { slots, .. } => lock(slots).drain(..).map(|(_, slot)| slot).collect(),
        };
        for slot in slots {
            let instance = slot.lock().await.take();
            if let Some(instance) = instance {
                instance.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{ini::PhpIni, sapi::testutil::StubManager, sapi::InstanceState};
    use pretty_assertions::assert_eq;

    fn key(tag: &str) -> TestCaseGroupKey {
        let mut env = BTreeMap::new();
        env.insert("TEST".to_string(), tag.to_string());
        TestCaseGroupKey {
            ini: Arc::new(PhpIni::new_baseline()),
            env,
        }
    }

    fn new_manager(concurrent: bool, capacity: usize) -> (Arc<StubManager>, SharedInstanceManager) {
        let stub = Arc::new(StubManager::new(concurrent));
        let shared = SharedInstanceManager::new(stub.clone(), capacity);
        (stub, shared)
    }

    async fn acquire_id(shared: &SharedInstanceManager, key: &TestCaseGroupKey) -> String {
        match shared.acquire(key).await {
            Acquired::Ready(lease) => lease.instance().sapi_output().unwrap(),
            Acquired::Crashed(report) => panic!("unexpected crash: {}", report.message),
        }
    }

    mod acquire {
        use super::*;

        #[tokio::test]
        async fn single_instance_is_replaced_per_key() {
            let (stub, shared) = new_manager(false, 4);
            let (a, b) = (key("A"), key("B"));

            let mut ids = vec![];
            for k in [&a, &a, &b, &a] {
                ids.push(acquire_id(&shared, k).await);
            }

            assert_eq!(
                vec![
                    "log of instance 0",
                    "log of instance 0",
                    "log of instance 1",
                    "log of instance 2"
                ],
                ids
            );
            assert_eq!(3, stub.spawn_count());
            assert!(stub.instance(0).closed.load(std::sync::atomic::Ordering::SeqCst));
            assert!(stub.instance(1).closed.load(std::sync::atomic::Ordering::SeqCst));
        }

        #[tokio::test]
        async fn pool_keeps_one_instance_per_key() {
            let (stub, shared) = new_manager(true, 4);
            let (a, b) = (key("A"), key("B"));

            let mut ids = vec![];
            for k in [&a, &a, &b, &a] {
                ids.push(acquire_id(&shared, k).await);
            }

            assert_eq!(
                vec![
                    "log of instance 0",
                    "log of instance 0",
                    "log of instance 1",
                    "log of instance 0"
                ],
                ids
            );
            assert_eq!(2, stub.spawn_count());
        }

        #[tokio::test]
        async fn pool_evicts_idle_instances_over_capacity() {
            let (stub, shared) = new_manager(true, 1);
            let (a, b) = (key("A"), key("B"));

            acquire_id(&shared, &a).await;
            acquire_id(&shared, &b).await;

            assert_eq!(2, stub.spawn_count());
            assert_eq!(InstanceState::Closed, stub.instance(0).state());
            assert_eq!(InstanceState::Running, stub.instance(1).state());
        }

        #[tokio::test]
        async fn pool_does_not_evict_leased_instances() {
            let (stub, shared) = new_manager(true, 1);
            let (a, b) = (key("A"), key("B"));

            let lease = match shared.acquire(&a).await {
                Acquired::Ready(lease) => lease,
                Acquired::Crashed(_) => panic!("unexpected crash"),
            };
            acquire_id(&shared, &b).await;

            assert_eq!(InstanceState::Running, lease.instance().state());
            assert_eq!(2, stub.spawn_count());
        }

        #[tokio::test]
        async fn pool_does_not_evict_slots_about_to_be_locked() {
            let (stub, shared) = new_manager(true, 1);
            let (a, b) = (key("A"), key("B"));

            let (pending, evicted) = shared.pool_slot(&a);
            assert!(evicted.is_empty());
            let (_, evicted) = shared.pool_slot(&b);

            assert!(evicted.is_empty());
            let Slots::Pool { slots, .. } = &shared.slots else {
                panic!("pool expected")
            };
            assert_eq!(vec![a.clone(), b], lock(slots).keys().cloned().collect::<Vec<_>>());
            assert!(Arc::ptr_eq(&pending, lock(slots).get(&a).unwrap()));

            drop(pending);
            assert_eq!("log of instance 0", acquire_id(&shared, &a).await);
            assert_eq!(1, stub.spawn_count());
        }

        #[tokio::test]
        async fn retired_instance_is_replaced() {
            let (stub, shared) = new_manager(true, 4);
            let a = key("A");

            acquire_id(&shared, &a).await;
            stub.instance(0).retire();

            assert_eq!("log of instance 1", acquire_id(&shared, &a).await);
            assert_eq!(InstanceState::Closed, stub.instance(0).state());
        }

        #[tokio::test]
        async fn instances_are_spawned_in_the_manager_docroot() {
            let stub = Arc::new(StubManager {
                docroot: std::path::PathBuf::from("/srv/pack"),
                ..StubManager::new(true)
            });
            let shared = SharedInstanceManager::new(stub.clone(), 1);

            acquire_id(&shared, &key("A")).await;

            assert_eq!(std::path::Path::new("/srv/pack"), stub.instance(0).docroot);
        }

        #[tokio::test]
        async fn crashed_instance_is_not_reused() {
            let (stub, shared) = new_manager(false, 1);
            let a = key("A");

            acquire_id(&shared, &a).await;
            stub.instance(0).mark_crashed();

            assert_eq!("log of instance 1", acquire_id(&shared, &a).await);
            assert_eq!(InstanceState::Crashed, stub.instance(0).state());
            assert!(stub.instance(0).closed.load(std::sync::atomic::Ordering::SeqCst));
        }

        #[tokio::test]
        async fn failed_spawn_is_reported_and_next_key_still_runs() {
            let (stub, shared) = new_manager(false, 1);
            lock(&stub.failures).insert("A".to_string(), 1);

            match shared.acquire(&key("A")).await {
                Acquired::Crashed(report) => {
                    assert_eq!(
                        CrashReport {
                            message: "A failed to start".to_string(),
                            sapi_output: Some("startup log".to_string()),
                        },
                        report
                    )
                }
                Acquired::Ready(_) => panic!("spawn should fail"),
            }

            assert_eq!("log of instance 0", acquire_id(&shared, &key("B")).await);
            assert_eq!("log of instance 1", acquire_id(&shared, &key("A")).await);
        }

        #[tokio::test]
        async fn single_lease_blocks_other_keys_until_dropped() {
            let (stub, shared) = new_manager(false, 1);
            let shared = Arc::new(shared);

            let lease = match shared.acquire(&key("A")).await {
                Acquired::Ready(lease) => lease,
                Acquired::Crashed(_) => panic!("unexpected crash"),
            };
            let waiter = {
                let shared = shared.clone();
                tokio::spawn(async move { acquire_id(&shared, &key("B")).await })
            };
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            assert_eq!(1, stub.spawn_count());
            drop(lease);
            assert_eq!("log of instance 1", waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn release_all_closes_every_instance() {
        let (stub, shared) = new_manager(true, 4);

        acquire_id(&shared, &key("A")).await;
        acquire_id(&shared, &key("B")).await;
        shared.release_all().await;

        assert_eq!(InstanceState::Closed, stub.instance(0).state());
        assert_eq!(InstanceState::Closed, stub.instance(1).state());
    }
}
