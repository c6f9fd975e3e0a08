use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::isolation::run_isolated;

use super::objects::{Liveness, ObjectId};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Names a class of event. Two subjects are the same event when their names
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(&'static str);

impl Subject {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug)]
pub struct Notification<'a, A> {
    pub subject: Subject,
    pub sender: Option<ObjectId>,
    pub args: &'a A,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Shared handler callback. Two registrations are "equal" when they hold the
/// same `Arc`.
pub type Handler<A> = Arc<dyn Fn(&Notification<'_, A>) -> HandlerResult + Send + Sync>;

pub fn handler<A, F>(callback: F) -> Handler<A>
where
    F: Fn(&Notification<'_, A>) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(callback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("timed out after {timeout_ms}ms waiting for the handler table during {operation}")]
    LockTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
    pub pruned: usize,
    pub lock_timed_out: bool,
}

struct Subscription<A> {
    id: SubscriptionId,
    handler: Handler<A>,
    owner: Option<ObjectId>,
    scope: Option<ObjectId>,
}

type SubjectMap<A> = HashMap<Subject, Vec<Subscription<A>>>;

struct HandlerTable<A> {
    global: SubjectMap<A>,
    scoped: HashMap<ObjectId, SubjectMap<A>>,
    next_id: u64,
}

impl<A> Default for HandlerTable<A> {
    fn default() -> Self {
        Self {
            global: HashMap::new(),
            scoped: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<A> HandlerTable<A> {
    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id = self.next_id.saturating_add(1);
        SubscriptionId(self.next_id)
    }

    fn remove_ids(&mut self, subject: Subject, ids: &[SubscriptionId]) -> usize {
        let mut removed = 0usize;
        if let Some(subscriptions) = self.global.get_mut(&subject) {
            let before = subscriptions.len();
            subscriptions.retain(|entry| !ids.contains(&entry.id));
            removed += before - subscriptions.len();
        }
        for by_subject in self.scoped.values_mut() {
            if let Some(subscriptions) = by_subject.get_mut(&subject) {
                let before = subscriptions.len();
                subscriptions.retain(|entry| !ids.contains(&entry.id));
                removed += before - subscriptions.len();
            }
        }
        self.drop_empty();
        removed
    }

    fn drop_empty(&mut self) {
        self.global.retain(|_, subscriptions| !subscriptions.is_empty());
        for by_subject in self.scoped.values_mut() {
            by_subject.retain(|_, subscriptions| !subscriptions.is_empty());
        }
        self.scoped.retain(|_, by_subject| !by_subject.is_empty());
    }
}

/// Multicast dispatch keyed by [`Subject`], with weak owners.
///
/// Every registration may name an owner object. The bus never keeps that
/// owner alive: a registration whose owner (or scope object) fails the
/// liveness check is skipped and pruned the next time its subject is
/// notified.
pub struct EventBus<A> {
    table: RwLock<HandlerTable<A>>,
    liveness: Arc<dyn Liveness>,
    lock_timeout: Duration,
}

impl<A> EventBus<A> {
    pub fn new(liveness: Arc<dyn Liveness>) -> Self {
        Self::with_lock_timeout(liveness, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(liveness: Arc<dyn Liveness>, lock_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(HandlerTable::default()),
            liveness,
            lock_timeout,
        }
    }

    pub fn add_handler(
        &self,
        subject: Subject,
        handler: Handler<A>,
        owner: Option<ObjectId>,
    ) -> Result<SubscriptionId, EventBusError> {
        let mut table = self.write_table("add_handler")?;
        let id = table.allocate_id();
        table.global.entry(subject).or_default().push(Subscription {
            id,
            handler,
            owner,
            scope: None,
        });
        Ok(id)
    }

    /// Returns `None` when the same handler is already registered for
    /// `subject`.
    pub fn add_handler_unique(
        &self,
        subject: Subject,
        handler: Handler<A>,
        owner: Option<ObjectId>,
    ) -> Result<Option<SubscriptionId>, EventBusError> {
        let mut table = self.write_table("add_handler_unique")?;
        let already_registered = table.global.get(&subject).is_some_and(|subscriptions| {
            subscriptions
                .iter()
                .any(|entry| Arc::ptr_eq(&entry.handler, &handler))
        });
        if already_registered {
            return Ok(None);
        }
        let id = table.allocate_id();
        table.global.entry(subject).or_default().push(Subscription {
            id,
            handler,
            owner,
            scope: None,
        });
        Ok(Some(id))
    }

    /// Registers a handler that only sees notifications sent by `scope`.
    pub fn add_object_handler(
        &self,
        scope: ObjectId,
        subject: Subject,
        handler: Handler<A>,
        owner: Option<ObjectId>,
    ) -> Result<SubscriptionId, EventBusError> {
        let mut table = self.write_table("add_object_handler")?;
        let id = table.allocate_id();
        table
            .scoped
            .entry(scope)
            .or_default()
            .entry(subject)
            .or_default()
            .push(Subscription {
                id,
                handler,
                owner,
                scope: Some(scope),
            });
        Ok(id)
    }

    /// Removes the first global registration of `handler` for `subject`.
    pub fn remove_handler(
        &self,
        subject: Subject,
        handler: &Handler<A>,
    ) -> Result<bool, EventBusError> {
        let mut table = self.write_table("remove_handler")?;
        let Some(subscriptions) = table.global.get_mut(&subject) else {
            return Ok(false);
        };
        let Some(position) = subscriptions
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.handler, handler))
        else {
            return Ok(false);
        };
        subscriptions.remove(position);
        table.drop_empty();
        Ok(true)
    }

    pub fn remove_subscription(
        &self,
        subject: Subject,
        id: SubscriptionId,
    ) -> Result<bool, EventBusError> {
        let mut table = self.write_table("remove_subscription")?;
        Ok(table.remove_ids(subject, &[id]) > 0)
    }

    /// Drops every registration for `subject`, global and object-scoped.
    pub fn remove_all_handlers(&self, subject: Subject) -> Result<usize, EventBusError> {
        let mut table = self.write_table("remove_all_handlers")?;
        let mut removed = table
            .global
            .remove(&subject)
            .map_or(0, |subscriptions| subscriptions.len());
        for by_subject in table.scoped.values_mut() {
            removed += by_subject
                .remove(&subject)
                .map_or(0, |subscriptions| subscriptions.len());
        }
        table.drop_empty();
        Ok(removed)
    }

    pub fn remove_object_handlers(&self, scope: ObjectId) -> Result<usize, EventBusError> {
        let mut table = self.write_table("remove_object_handlers")?;
        Ok(table.scoped.remove(&scope).map_or(0, |by_subject| {
            by_subject.values().map(Vec::len).sum::<usize>()
        }))
    }

    pub fn clear(&self) -> Result<(), EventBusError> {
        let mut table = self.write_table("clear")?;
        table.global.clear();
        table.scoped.clear();
        Ok(())
    }

    /// Invokes the live handlers registered for `subject`: the sender's
    /// object-scoped handlers first, then the global ones.
    ///
    /// A failing or panicking handler is logged and the remaining handlers
    /// still run. When the table lock cannot be taken within the bounded
    /// wait, nothing is dispatched and the report says so.
    pub fn notify(&self, subject: Subject, sender: Option<ObjectId>, args: &A) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut live: Vec<Handler<A>> = Vec::new();
        let mut dead: Vec<SubscriptionId> = Vec::new();

        {
            let Some(table) = self.table.try_read_for(self.lock_timeout) else {
                warn!(
                    subject = %subject,
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "event_bus_lock_timeout"
                );
                report.lock_timed_out = true;
                return report;
            };

            let scoped = sender
                .and_then(|sender| table.scoped.get(&sender))
                .and_then(|by_subject| by_subject.get(&subject));
            let global = table.global.get(&subject);
            for entry in scoped.into_iter().chain(global).flatten() {
                if self.is_live(entry) {
                    live.push(Arc::clone(&entry.handler));
                } else {
                    dead.push(entry.id);
                }
            }
        }

        let notification = Notification {
            subject,
            sender,
            args,
        };
        for handler in live {
            report.invoked += 1;
            match run_isolated(|| handler(&notification)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failed += 1;
                    error!(subject = %subject, error = %err, "event_handler_failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(subject = %subject, panic = %panic, "event_handler_panicked");
                }
            }
        }

        if !dead.is_empty() {
            report.pruned = self.prune(subject, &dead);
        }
        report
    }

    /// Sweeps every subject for registrations whose owner or scope is gone.
    pub fn prune_dead(&self) -> usize {
        let Some(mut table) = self.table.try_write_for(self.lock_timeout) else {
            debug!("event_bus_sweep_skipped");
            return 0;
        };
        let liveness = Arc::clone(&self.liveness);
        let mut removed = 0usize;
        table.scoped.retain(|scope, by_subject| {
            if liveness.is_alive(*scope) {
                return true;
            }
            removed += by_subject.values().map(Vec::len).sum::<usize>();
            false
        });
        let HandlerTable { global, scoped, .. } = &mut *table;
        for subscriptions in global
            .values_mut()
            .chain(scoped.values_mut().flat_map(|by_subject| by_subject.values_mut()))
        {
            let before = subscriptions.len();
            subscriptions.retain(|entry| entry.owner.map_or(true, |owner| liveness.is_alive(owner)));
            removed += before - subscriptions.len();
        }
        table.drop_empty();
        removed
    }

    /// Handlers registered for `subject`. Counts read as 0 when the table
    /// stays locked past the bus timeout.
    pub fn handler_count(&self, subject: Subject) -> usize {
        let Some(table) = self.read_table("handler_count") else {
            return 0;
        };
        let global = table.global.get(&subject).map_or(0, Vec::len);
        let scoped: usize = table
            .scoped
            .values()
            .filter_map(|by_subject| by_subject.get(&subject))
            .map(Vec::len)
            .sum();
        global + scoped
    }

    pub fn global_handler_count(&self) -> usize {
        self.read_table("global_handler_count")
            .map_or(0, |table| table.global.values().map(Vec::len).sum())
    }

    pub fn object_handler_count(&self) -> usize {
        self.read_table("object_handler_count").map_or(0, |table| {
            table
                .scoped
                .values()
                .flat_map(|by_subject| by_subject.values())
                .map(Vec::len)
                .sum()
        })
    }

    fn read_table(&self, operation: &'static str) -> Option<RwLockReadGuard<'_, HandlerTable<A>>> {
        let table = self.table.try_read_for(self.lock_timeout);
        if table.is_none() {
            warn!(
                operation,
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "event_bus_lock_timeout"
            );
        }
        table
    }

    fn is_live(&self, entry: &Subscription<A>) -> bool {
        let owner_alive = entry.owner.map_or(true, |owner| self.liveness.is_alive(owner));
        let scope_alive = entry.scope.map_or(true, |scope| self.liveness.is_alive(scope));
        owner_alive && scope_alive
    }

    fn prune(&self, subject: Subject, dead: &[SubscriptionId]) -> usize {
        match self.table.try_write_for(self.lock_timeout) {
            Some(mut table) => {
                let removed = table.remove_ids(subject, dead);
                debug!(subject = %subject, removed, "event_handlers_pruned");
                removed
            }
            None => {
                warn!(subject = %subject, "event_bus_prune_deferred");
                0
            }
        }
    }

    fn write_table(
        &self,
        operation: &'static str,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, HandlerTable<A>>, EventBusError> {
        self.table
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| {
                warn!(operation, "event_bus_lock_timeout");
                EventBusError::LockTimeout {
                    operation,
                    timeout_ms: self.lock_timeout.as_millis() as u64,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::events::objects::ObjectRegistry;

    const DIED: Subject = Subject::new("Died");
    const HIT: Subject = Subject::new("Hit");

    fn bus_with_registry() -> (EventBus<u32>, Arc<ObjectRegistry>) {
        let registry = Arc::new(ObjectRegistry::new());
        let bus = EventBus::new(registry.clone() as Arc<dyn Liveness>);
        (bus, registry)
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler<u32> {
        let counter = Arc::clone(counter);
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dead_owner_handler_is_skipped_and_pruned() {
        let (bus, registry) = bus_with_registry();
        let owner = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(DIED, counting_handler(&calls), Some(owner))
            .expect("add");

        registry.release(owner);
        let report = bus.notify(DIED, None, &0);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.invoked, 0);
        assert_eq!(report.pruned, 1);
        assert_eq!(bus.handler_count(DIED), 0);
    }

    #[test]
    fn live_owner_handler_keeps_firing() {
        let (bus, registry) = bus_with_registry();
        let owner = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(DIED, counting_handler(&calls), Some(owner))
            .expect("add");

        bus.notify(DIED, None, &0);
        bus.notify(DIED, None, &0);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_count(DIED), 1);
    }

    #[test]
    fn duplicate_handlers_count_separately_unless_unique() {
        let (bus, _registry) = bus_with_registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let shared = counting_handler(&calls);

        bus.add_handler(HIT, Arc::clone(&shared), None).expect("add");
        bus.add_handler(HIT, Arc::clone(&shared), None).expect("add");
        let unique = bus
            .add_handler_unique(HIT, Arc::clone(&shared), None)
            .expect("add unique");

        assert!(unique.is_none());
        assert_eq!(bus.handler_count(HIT), 2);
        bus.notify(HIT, None, &1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_handler_drops_only_first_match() {
        let (bus, _registry) = bus_with_registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let shared = counting_handler(&calls);
        bus.add_handler(HIT, Arc::clone(&shared), None).expect("add");
        bus.add_handler(HIT, Arc::clone(&shared), None).expect("add");

        assert!(bus.remove_handler(HIT, &shared).expect("remove"));
        assert_eq!(bus.handler_count(HIT), 1);

        let stranger = counting_handler(&calls);
        assert!(!bus.remove_handler(HIT, &stranger).expect("remove absent"));
        assert!(!bus.remove_handler(DIED, &shared).expect("remove absent"));
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_dispatch() {
        let (bus, _registry) = bus_with_registry();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(HIT, handler(|_| Err(HandlerError::new("nope"))), None)
            .expect("add");
        bus.add_handler(HIT, handler(|_| panic!("handler blew up")), None)
            .expect("add");
        bus.add_handler(HIT, counting_handler(&calls), None)
            .expect("add");

        let report = bus.notify(HIT, None, &5);

        assert_eq!(report.invoked, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_handlers_fire_before_global_and_only_for_their_sender() {
        let (bus, registry) = bus_with_registry();
        let boss = registry.register();
        let other = registry.register();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let scoped_order = Arc::clone(&order);
        bus.add_object_handler(
            boss,
            DIED,
            handler(move |_| {
                scoped_order.lock().push("scoped");
                Ok(())
            }),
            None,
        )
        .expect("add scoped");
        let global_order = Arc::clone(&order);
        bus.add_handler(
            DIED,
            handler(move |_| {
                global_order.lock().push("global");
                Ok(())
            }),
            None,
        )
        .expect("add global");

        bus.notify(DIED, Some(boss), &0);
        bus.notify(DIED, Some(other), &0);

        assert_eq!(*order.lock(), vec!["scoped", "global", "global"]);
        assert_eq!(bus.object_handler_count(), 1);
        assert_eq!(bus.global_handler_count(), 1);
    }

    #[test]
    fn dead_scope_object_prunes_its_handlers() {
        let (bus, registry) = bus_with_registry();
        let boss = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_object_handler(boss, DIED, counting_handler(&calls), None)
            .expect("add");

        registry.release(boss);
        let report = bus.notify(DIED, Some(boss), &0);

        assert_eq!(report.pruned, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.object_handler_count(), 0);
    }

    #[test]
    fn bulk_removal_clears_subject_and_objects() {
        let (bus, registry) = bus_with_registry();
        let boss = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(DIED, counting_handler(&calls), None).expect("add");
        bus.add_object_handler(boss, DIED, counting_handler(&calls), None)
            .expect("add");
        bus.add_handler(HIT, counting_handler(&calls), None).expect("add");

        assert_eq!(bus.remove_all_handlers(DIED).expect("remove all"), 2);
        assert_eq!(bus.handler_count(HIT), 1);

        bus.add_object_handler(boss, HIT, counting_handler(&calls), None)
            .expect("add");
        assert_eq!(bus.remove_object_handlers(boss).expect("remove object"), 1);

        bus.clear().expect("clear");
        assert_eq!(bus.global_handler_count(), 0);
    }

    #[test]
    fn sweep_removes_handlers_that_were_never_notified() {
        let (bus, registry) = bus_with_registry();
        let owner = registry.register();
        let scope = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(HIT, counting_handler(&calls), Some(owner))
            .expect("add");
        bus.add_object_handler(scope, DIED, counting_handler(&calls), None)
            .expect("add");

        registry.release(owner);
        registry.release(scope);

        assert_eq!(bus.prune_dead(), 2);
        assert_eq!(bus.global_handler_count() + bus.object_handler_count(), 0);
    }

    #[test]
    fn handler_may_register_more_handlers_during_dispatch() {
        let registry = Arc::new(ObjectRegistry::new());
        let bus = Arc::new(EventBus::<u32>::new(registry as Arc<dyn Liveness>));
        let inner_bus = Arc::clone(&bus);
        bus.add_handler(
            HIT,
            handler(move |_| {
                inner_bus
                    .add_handler(DIED, handler(|_| Ok(())), None)
                    .map(|_| ())
                    .map_err(|err| HandlerError::new(err.to_string()))
            }),
            None,
        )
        .expect("add");

        let report = bus.notify(HIT, None, &0);
        assert_eq!(report.failed, 0);
        assert_eq!(bus.handler_count(DIED), 1);
    }

    #[test]
    fn write_lock_timeout_means_no_dispatch() {
        let registry = Arc::new(ObjectRegistry::new());
        let bus = EventBus::<u32>::with_lock_timeout(
            registry as Arc<dyn Liveness>,
            Duration::from_millis(10),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(HIT, counting_handler(&calls), None).expect("add");

        let guard = bus.table.write();
        let report = thread::scope(|scope| {
            scope
                .spawn(|| bus.notify(HIT, None, &0))
                .join()
                .expect("notify thread")
        });
        drop(guard);

        assert!(report.lock_timed_out);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn counts_read_zero_instead_of_blocking_on_a_held_lock() {
        let registry = Arc::new(ObjectRegistry::new());
        let bus = EventBus::<u32>::with_lock_timeout(
            registry as Arc<dyn Liveness>,
            Duration::from_millis(10),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        bus.add_handler(HIT, counting_handler(&calls), None).expect("add");

        let guard = bus.table.write();
        let counts = thread::scope(|scope| {
            scope
                .spawn(|| {
                    (
                        bus.handler_count(HIT),
                        bus.global_handler_count(),
                        bus.object_handler_count(),
                    )
                })
                .join()
                .expect("count thread")
        });
        drop(guard);

        assert_eq!(counts, (0, 0, 0));
        assert_eq!(bus.handler_count(HIT), 1);
        assert_eq!(bus.global_handler_count(), 1);
    }

    #[test]
    fn concurrent_notify_and_registration_are_safe() {
        let (bus, registry) = bus_with_registry();
        let calls = Arc::new(AtomicUsize::new(0));
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        bus.notify(HIT, None, &0);
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..50 {
                    let owner = registry.register();
                    bus.add_handler(HIT, counting_handler(&calls), Some(owner))
                        .expect("add");
                    registry.release(owner);
                }
            });
        });

        bus.notify(HIT, None, &0);
        assert_eq!(bus.handler_count(HIT), 0);
    }
}
