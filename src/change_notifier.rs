//! Flag change detection and observer dispatch.
//!
//! [`ChangeNotifier`] diffs two flag snapshots and hands the result to registered observers. All
//! handlers run on a dedicated delivery thread, so a slow handler never stalls flag store writers
//! or the network thread.
//!
//! Observers are owned by an [`ObserverOwner`]. Dropping the owner retires all of its observers:
//! they are never invoked again and are pruned on the next dispatch.
use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{flag_store::FlagSnapshot, ConnectionMode, Error, FlagValue};

/// A change to one flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFlag {
    #[allow(missing_docs)]
    pub key: String,
    /// Value before the change, null if the flag did not exist.
    pub old_value: FlagValue,
    /// Value after the change, null if the flag no longer exists.
    pub new_value: FlagValue,
}

/// Changed flags by key.
pub type ChangedFlags = HashMap<String, ChangedFlag>;

/// Compute the flags that differ between `prior` and `current`.
///
/// A key is reported if it exists on only one side, or if the two flags are not the same
/// evaluation (see [`FeatureFlag::is_same_evaluation`](crate::FeatureFlag::is_same_evaluation)).
pub fn diff(prior: &FlagSnapshot, current: &FlagSnapshot) -> ChangedFlags {
    let mut changed = ChangedFlags::new();

    for (key, old) in prior.flags() {
        match current.get(key) {
            Some(new) if old.is_same_evaluation(new) => {}
            new => {
                changed.insert(
                    key.to_owned(),
                    ChangedFlag {
                        key: key.to_owned(),
                        old_value: old.value.clone(),
                        new_value: new.map(|flag| flag.value.clone()).unwrap_or_default(),
                    },
                );
            }
        }
    }
    for (key, new) in current.flags() {
        if prior.get(key).is_none() {
            changed.insert(
                key.to_owned(),
                ChangedFlag {
                    key: key.to_owned(),
                    old_value: FlagValue::Null,
                    new_value: new.value.clone(),
                },
            );
        }
    }

    changed
}

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Owns observer registrations.
///
/// Keep the owner alive for as long as its observers should fire. Dropping it is equivalent to
/// calling [`ChangeNotifier::remove_observers`], except that cleanup happens lazily.
///
/// ```
/// # use flagsync::ObserverOwner;
/// let owner = ObserverOwner::new();
/// // register observers with `&owner`...
/// drop(owner); // ...and they never fire again.
/// ```
#[derive(Debug)]
pub struct ObserverOwner {
    token: OwnerToken,
}

impl ObserverOwner {
    #[allow(missing_docs)]
    pub fn new() -> ObserverOwner {
        ObserverOwner {
            token: OwnerToken {
                id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
                alive: Arc::new(AtomicBool::new(true)),
            },
        }
    }

    /// Unique id of this owner.
    pub fn id(&self) -> u64 {
        self.token.id
    }
}

impl Default for ObserverOwner {
    fn default() -> ObserverOwner {
        ObserverOwner::new()
    }
}

impl Drop for ObserverOwner {
    fn drop(&mut self) {
        self.token.alive.store(false, Ordering::Release);
    }
}

/// Liveness token held by the registry on behalf of an [`ObserverOwner`].
#[derive(Debug, Clone)]
struct OwnerToken {
    id: u64,
    alive: Arc<AtomicBool>,
}

impl OwnerToken {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

type FlagChangeHandler = Arc<dyn Fn(&ChangedFlag) + Send + Sync>;
type FlagCollectionChangeHandler = Arc<dyn Fn(&ChangedFlags) + Send + Sync>;
type FlagsUnchangedHandler = Arc<dyn Fn() + Send + Sync>;
type ConnectionModeChangedHandler = Arc<dyn Fn(ConnectionMode) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone)]
enum FlagHandler {
    /// Invoked once per changed flag.
    Single(FlagChangeHandler),
    /// Invoked once with all matching changes.
    Collection(FlagCollectionChangeHandler),
}

#[derive(Clone)]
struct FlagChangeObserver {
    owner: OwnerToken,
    /// `None` observes all keys.
    keys: Option<HashSet<String>>,
    handler: FlagHandler,
}

impl FlagChangeObserver {
    fn select(&self, changed: &ChangedFlags) -> ChangedFlags {
        match &self.keys {
            None => changed.clone(),
            Some(keys) => changed
                .iter()
                .filter(|(key, _)| keys.contains(*key))
                .map(|(key, change)| (key.clone(), change.clone()))
                .collect(),
        }
    }
}

#[derive(Clone)]
struct Registration<H> {
    owner: OwnerToken,
    handler: H,
}

#[derive(Default)]
struct Registry {
    flag_change: Vec<FlagChangeObserver>,
    flags_unchanged: Vec<Registration<FlagsUnchangedHandler>>,
    connection_mode_changed: Vec<Registration<ConnectionModeChangedHandler>>,
    error: Vec<Registration<ErrorHandler>>,
}

impl Registry {
    fn prune(&mut self) {
        self.flag_change.retain(|o| o.owner.is_alive());
        self.flags_unchanged.retain(|o| o.owner.is_alive());
        self.connection_mode_changed.retain(|o| o.owner.is_alive());
        self.error.retain(|o| o.owner.is_alive());
    }

    fn remove(&mut self, owner_id: u64) {
        self.flag_change.retain(|o| o.owner.id != owner_id);
        self.flags_unchanged.retain(|o| o.owner.id != owner_id);
        self.connection_mode_changed.retain(|o| o.owner.id != owner_id);
        self.error.retain(|o| o.owner.id != owner_id);
    }

    fn len(&self) -> usize {
        self.flag_change.len()
            + self.flags_unchanged.len()
            + self.connection_mode_changed.len()
            + self.error.len()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Registry of observers plus the thread that invokes them.
pub struct ChangeNotifier {
    registry: Mutex<Registry>,
    sender: Mutex<Option<Sender<Job>>>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ChangeNotifier {
    /// Create a notifier and start its delivery thread.
    pub fn start() -> std::io::Result<ChangeNotifier> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let join_handle = std::thread::Builder::new()
            .name("flagsync-notifier".to_owned())
            .spawn(move || {
                log::debug!(target: "flagsync", "notifier thread started");
                while let Ok(job) = receiver.recv() {
                    job();
                }
                log::debug!(target: "flagsync", "notifier thread stopped");
            })?;

        Ok(ChangeNotifier {
            registry: Mutex::new(Registry::default()),
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Observe changes to a single flag. `handler` receives the change of that flag.
    pub fn observe(
        &self,
        key: impl Into<String>,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlag) + Send + Sync + 'static,
    ) {
        self.add_flag_observer(FlagChangeObserver {
            owner: owner.token.clone(),
            keys: Some(HashSet::from([key.into()])),
            handler: FlagHandler::Single(Arc::new(handler)),
        });
    }

    /// Observe changes to any of `keys`. `handler` receives the changes restricted to `keys`,
    /// once per update.
    pub fn observe_keys<I, K>(
        &self,
        keys: I,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlags) + Send + Sync + 'static,
    ) where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.add_flag_observer(FlagChangeObserver {
            owner: owner.token.clone(),
            keys: Some(keys.into_iter().map(Into::into).collect()),
            handler: FlagHandler::Collection(Arc::new(handler)),
        });
    }

    /// Observe changes to any flag. `handler` receives all changes of an update.
    pub fn observe_all(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(&ChangedFlags) + Send + Sync + 'static,
    ) {
        self.add_flag_observer(FlagChangeObserver {
            owner: owner.token.clone(),
            keys: None,
            handler: FlagHandler::Collection(Arc::new(handler)),
        });
    }

    /// Observe updates that did not change any flag.
    pub fn observe_flags_unchanged(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn() + Send + Sync + 'static,
    ) {
        log::debug!(target: "flagsync", owner = owner.id(); "adding flags unchanged observer");
        self.lock_registry().flags_unchanged.push(Registration {
            owner: owner.token.clone(),
            handler: Arc::new(handler),
        });
    }

    /// Observe changes of the connection mode.
    pub fn observe_connection_mode_changed(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(ConnectionMode) + Send + Sync + 'static,
    ) {
        log::debug!(target: "flagsync", owner = owner.id(); "adding connection mode observer");
        self.lock_registry().connection_mode_changed.push(Registration {
            owner: owner.token.clone(),
            handler: Arc::new(handler),
        });
    }

    /// Observe recoverable data source errors.
    pub fn observe_error(
        &self,
        owner: &ObserverOwner,
        handler: impl Fn(&Error) + Send + Sync + 'static,
    ) {
        log::debug!(target: "flagsync", owner = owner.id(); "adding error observer");
        self.lock_registry().error.push(Registration {
            owner: owner.token.clone(),
            handler: Arc::new(handler),
        });
    }

    /// Remove every observer registered by `owner`.
    pub fn remove_observers(&self, owner: &ObserverOwner) {
        log::debug!(target: "flagsync", owner = owner.id(); "removing observers");
        self.lock_registry().remove(owner.id());
    }

    /// Number of registrations currently held, including not yet pruned dead ones.
    pub fn registered_observers(&self) -> usize {
        self.lock_registry().len()
    }

    /// Diff `prior` against `current` and dispatch the result.
    ///
    /// If nothing changed, flags-unchanged observers are notified instead.
    pub fn notify(&self, prior: &FlagSnapshot, current: &FlagSnapshot) {
        let changed = diff(prior, current);
        if changed.is_empty() {
            self.notify_unchanged();
            return;
        }

        let observers: Vec<(FlagChangeObserver, ChangedFlags)> = {
            let mut registry = self.lock_registry();
            registry.prune();
            registry
                .flag_change
                .iter()
                .filter_map(|observer| {
                    let selected = observer.select(&changed);
                    (!selected.is_empty()).then(|| (observer.clone(), selected))
                })
                .collect()
        };
        if observers.is_empty() {
            log::debug!(target: "flagsync", "no observers watching changed flags");
            return;
        }

        log::debug!(target: "flagsync", "notifying observers of {} changed flags", changed.len());
        self.deliver(move || {
            for (observer, selected) in observers {
                match &observer.handler {
                    FlagHandler::Single(handler) => {
                        for change in selected.values() {
                            invoke(&observer.owner, || handler(change));
                        }
                    }
                    FlagHandler::Collection(handler) => {
                        invoke(&observer.owner, || handler(&selected));
                    }
                }
            }
        });
    }

    /// Notify flags-unchanged observers.
    pub fn notify_unchanged(&self) {
        let observers = {
            let mut registry = self.lock_registry();
            registry.prune();
            registry.flags_unchanged.clone()
        };
        if observers.is_empty() {
            return;
        }

        log::debug!(target: "flagsync", "notifying observers that flags are unchanged");
        self.deliver(move || {
            for observer in observers {
                invoke(&observer.owner, || (observer.handler)());
            }
        });
    }

    /// Notify connection mode observers.
    pub fn notify_connection_mode_changed(&self, mode: ConnectionMode) {
        let observers = {
            let mut registry = self.lock_registry();
            registry.prune();
            registry.connection_mode_changed.clone()
        };
        if observers.is_empty() {
            return;
        }

        self.deliver(move || {
            for observer in observers {
                invoke(&observer.owner, || (observer.handler)(mode));
            }
        });
    }

    /// Notify error observers.
    pub fn notify_error(&self, error: Error) {
        let observers = {
            let mut registry = self.lock_registry();
            registry.prune();
            registry.error.clone()
        };
        if observers.is_empty() {
            return;
        }

        self.deliver(move || {
            for observer in observers {
                invoke(&observer.owner, || (observer.handler)(&error));
            }
        });
    }

    /// Block until every notification queued so far has been delivered, waiting at most
    /// `timeout`. Returns `false` on timeout or if the delivery thread has stopped.
    pub fn wait_for_delivery(&self, timeout: Duration) -> bool {
        let (done_sender, done_receiver) = mpsc::channel();
        self.deliver(move || {
            let _ = done_sender.send(());
        });
        done_receiver.recv_timeout(timeout).is_ok()
    }

    /// Deliver outstanding notifications and stop the delivery thread.
    pub fn shutdown(&self, timeout: Duration) -> crate::Result<()> {
        let delivered = self.wait_for_delivery(timeout);

        self.sender
            .lock()
            .expect("thread holding notifier lock should not panic")
            .take();
        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding notifier lock should not panic")
            .take();

        match join_handle {
            Some(join_handle) if delivered => {
                join_handle.join().map_err(|_| Error::ThreadPanicked)
            }
            Some(_) => Err(Error::ShutdownTimeout),
            None => Ok(()),
        }
    }

    fn add_flag_observer(&self, observer: FlagChangeObserver) {
        log::debug!(target: "flagsync", owner = observer.owner.id; "adding flag change observer");
        self.lock_registry().flag_change.push(observer);
    }

    fn deliver(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self
            .sender
            .lock()
            .expect("thread holding notifier lock should not panic");
        let sent = sender
            .as_ref()
            .map_or(false, |sender| sender.send(Box::new(job)).is_ok());
        if !sent {
            log::debug!(target: "flagsync", "notifier is shut down, dropping notification");
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .expect("thread holding observer registry lock should not panic")
    }
}

/// Run a handler if its owner is still alive, isolating panics.
fn invoke(owner: &OwnerToken, handler: impl FnOnce()) {
    if !owner.is_alive() {
        return;
    }
    if catch_unwind(AssertUnwindSafe(handler)).is_err() {
        log::error!(target: "flagsync", owner = owner.id; "observer handler panicked");
    }
}
