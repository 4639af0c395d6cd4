//! Type-directed, order-independent capability resolution.
//!
//! Design goals:
//! - Providers announce a capability once (a registered module, or an explicit feature).
//! - Consumers request capabilities by *type* (concrete type or trait object) without
//!   knowing who provides them or whether the provider has been initialized yet.
//! - A request that cannot be satisfied right away is parked and fires automatically,
//!   exactly once, when the last missing type is announced.
//!
//! Typical flows:
//! - During `init`, a provider module exposes an interface with `ctx.add_feature::<dyn Api>(..)`.
//! - A consumer calls `ctx.request::<(Arc<dyn Api>, Arc<Other>), _>(|(api, other)| ..)` and keeps
//!   the resolved `Arc`s. Registration order of provider and consumer does not matter.
//! - Marker types work as ordering barriers: require `LoggerReady` without taking it as a parameter.
//!
//! Implementation details:
//! - Key = `TypeId` of `T` (works for `T = dyn Trait`), with `type_name` kept for diagnostics.
//! - Value = `Arc<T>` stored as `Box<dyn Any + Send + Sync>` (downcast on read).
//! - Lookup order is fixed for determinism: user modules, then default-tier modules, then
//!   explicitly added features. First match wins.
//! - The known set only grows. Callbacks run outside the lock, so a callback may announce
//!   further capabilities.

use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::contracts::ModuleTier;

/// Stable identifier of a capability type.
#[derive(Clone, Copy)]
pub struct CapabilityKey {
    id: TypeId,
    name: &'static str,
}

impl CapabilityKey {
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Fully-qualified type name, for diagnostics only.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for CapabilityKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CapabilityKey {}

impl Hash for CapabilityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("capability not found: type={key:?}")]
    NotFound { key: CapabilityKey },

    #[error("type mismatch in capability set for type={key:?}")]
    TypeMismatch { key: CapabilityKey },

    /// The callback takes a parameter that the request does not require.
    #[error("callback parameter type={key:?} is not among the required capabilities")]
    UndeclaredParameter { key: CapabilityKey },
}

/// Outcome of a capability request. Neither variant is a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every required type was known; the callback already ran.
    Resolved,
    /// Parked until the listed types are announced.
    Deferred { missing: Vec<CapabilityKey> },
}

/// Diagnostic view of a parked request.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub owner: Option<Arc<str>>,
    pub missing: Vec<CapabilityKey>,
}

type Boxed = Box<dyn Any + Send + Sync>;
type Thunk = Box<dyn FnOnce() + Send>;
type BindFn = Box<dyn FnOnce(&CapabilitySet<'_>) -> Result<Thunk, ResolveError> + Send>;

struct Entry {
    key: CapabilityKey,
    provider: Arc<str>,
    value: Boxed,
}

struct Pending {
    owner: Option<Arc<str>>,
    required: Vec<CapabilityKey>,
    bind: BindFn,
}

#[derive(Default)]
struct State {
    modules: Vec<Entry>,
    default_modules: Vec<Entry>,
    features: Vec<Entry>,
    pending: Vec<Pending>,
}

impl State {
    fn view(&self) -> CapabilitySet<'_> {
        CapabilitySet { state: self }
    }

    fn is_satisfied(&self, required: &[CapabilityKey]) -> bool {
        let view = self.view();
        required.iter().all(|k| view.contains(*k))
    }

    fn missing(&self, required: &[CapabilityKey]) -> Vec<CapabilityKey> {
        let view = self.view();
        required
            .iter()
            .filter(|k| !view.contains(**k))
            .copied()
            .collect()
    }

    /// Detach every pending request that is now satisfied, preserving registration order.
    fn take_ready(&mut self) -> Vec<Pending> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.is_satisfied(&self.pending[i].required) {
                ready.push(self.pending.remove(i));
            } else {
                i += 1;
            }
        }
        ready
    }
}

/// Read-only view over the announced capabilities.
pub struct CapabilitySet<'a> {
    state: &'a State,
}

impl CapabilitySet<'_> {
    fn lookup(&self, key: CapabilityKey) -> Option<&Entry> {
        self.state
            .modules
            .iter()
            .chain(self.state.default_modules.iter())
            .chain(self.state.features.iter())
            .find(|e| e.key == key)
    }

    #[must_use]
    pub fn contains(&self, key: CapabilityKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Fetch a capability by type.
    ///
    /// # Errors
    /// `NotFound` if nothing announced `T`, `TypeMismatch` if the stored value is not an `Arc<T>`.
    pub fn get<T>(&self) -> Result<Arc<T>, ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = CapabilityKey::of::<T>();
        let entry = self.lookup(key).ok_or(ResolveError::NotFound { key })?;
        entry
            .value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(ResolveError::TypeMismatch { key })
    }
}

/// A set of capability types a callback consumes, bound by type.
///
/// Implemented for `()`, `Arc<T>` and tuples of `Arc<_>` up to six elements.
pub trait Requirements: Sized + Send + 'static {
    fn keys() -> Vec<CapabilityKey>;

    /// # Errors
    /// Propagates lookup failures from [`CapabilitySet::get`].
    fn bind(set: &CapabilitySet<'_>) -> Result<Self, ResolveError>;
}

impl Requirements for () {
    fn keys() -> Vec<CapabilityKey> {
        Vec::new()
    }

    fn bind(_set: &CapabilitySet<'_>) -> Result<Self, ResolveError> {
        Ok(())
    }
}

impl<A> Requirements for Arc<A>
where
    A: ?Sized + Send + Sync + 'static,
{
    fn keys() -> Vec<CapabilityKey> {
        vec![CapabilityKey::of::<A>()]
    }

    fn bind(set: &CapabilitySet<'_>) -> Result<Self, ResolveError> {
        set.get::<A>()
    }
}

macro_rules! impl_requirements_for_tuple {
    ($($t:ident),+) => {
        impl<$($t),+> Requirements for ($(Arc<$t>,)+)
        where
            $($t: ?Sized + Send + Sync + 'static),+
        {
            fn keys() -> Vec<CapabilityKey> {
                vec![$(CapabilityKey::of::<$t>()),+]
            }

            fn bind(set: &CapabilitySet<'_>) -> Result<Self, ResolveError> {
                Ok(($(set.get::<$t>()?,)+))
            }
        }
    };
}

impl_requirements_for_tuple!(A);
impl_requirements_for_tuple!(A, B);
impl_requirements_for_tuple!(A, B, C);
impl_requirements_for_tuple!(A, B, C, D);
impl_requirements_for_tuple!(A, B, C, D, E);
impl_requirements_for_tuple!(A, B, C, D, E, F);

/// Monotonically growing capability set plus the list of parked requests.
pub struct CapabilityResolver {
    state: Mutex<State>,
}

impl CapabilityResolver {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for CapabilityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityResolver {
    /// Announce a registered module as a capability of its own concrete type.
    pub(crate) fn announce_module<M>(&self, tier: ModuleTier, name: Arc<str>, module: Arc<M>)
    where
        M: Send + Sync + 'static,
    {
        let entry = Entry {
            key: CapabilityKey::of::<M>(),
            provider: name,
            value: Box::new(module),
        };
        self.announce(entry, Some(tier));
    }

    /// Add a standalone capability under the type `T`.
    ///
    /// `T` can be a trait object like `dyn my_module::contract::MyApi`.
    /// Safe to call concurrently with running tasks.
    pub fn add_feature<T>(&self, feature: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = Entry {
            key: CapabilityKey::of::<T>(),
            provider: Arc::from("feature"),
            value: Box::new(feature),
        };
        self.announce(entry, None);
    }

    fn announce(&self, entry: Entry, tier: Option<ModuleTier>) {
        let thunks: Vec<Thunk> = {
            let mut w = self.state.lock();
            let state = &mut *w;
            tracing::debug!(
                capability = entry.key.name(),
                provider = %entry.provider,
                "capability announced"
            );
            match tier {
                Some(ModuleTier::User) => state.modules.push(entry),
                Some(ModuleTier::Default) => state.default_modules.push(entry),
                None => state.features.push(entry),
            }

            let ready = state.take_ready();
            let view = state.view();
            ready
                .into_iter()
                .filter_map(|p| match (p.bind)(&view) {
                    Ok(thunk) => Some(thunk),
                    Err(e) => {
                        tracing::error!(
                            owner = p.owner.as_deref(),
                            error = %e,
                            "failed to bind resolved capabilities"
                        );
                        None
                    }
                })
                .collect()
        };

        for thunk in thunks {
            thunk();
        }
    }

    /// Request the capabilities `R`, requiring exactly the types `R` consumes.
    ///
    /// # Errors
    /// See [`CapabilityResolver::request_capabilities`].
    pub fn request<R, F>(&self, owner: Option<&str>, callback: F) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        let required = R::keys();
        self.request_capabilities::<R, F>(owner, &required, callback)
    }

    /// Resolve `required` against the known set and hand `R` to `callback`.
    ///
    /// If every required type is known the callback runs before this returns.
    /// Otherwise the request is parked and fires once, when the last missing type is announced.
    /// A request that is never satisfied stays parked forever; it is not an error.
    ///
    /// # Errors
    /// `UndeclaredParameter` if `R` consumes a type absent from `required` (a programming error).
    pub fn request_capabilities<R, F>(
        &self,
        owner: Option<&str>,
        required: &[CapabilityKey],
        callback: F,
    ) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        if let Some(key) = R::keys().into_iter().find(|k| !required.contains(k)) {
            return Err(ResolveError::UndeclaredParameter { key });
        }

        let bind: BindFn = Box::new(move |set: &CapabilitySet<'_>| {
            let bound = R::bind(set)?;
            Ok(Box::new(move || callback(bound)) as Thunk)
        });

        let mut w = self.state.lock();
        if w.is_satisfied(required) {
            let thunk = bind(&w.view())?;
            drop(w);
            thunk();
            return Ok(Resolution::Resolved);
        }

        let missing = w.missing(required);
        tracing::debug!(owner, missing = ?missing, "capability request deferred");
        w.pending.push(Pending {
            owner: owner.map(Arc::from),
            required: required.to_vec(),
            bind,
        });
        Ok(Resolution::Deferred { missing })
    }

    /// Fetch a capability by type, without waiting.
    ///
    /// # Errors
    /// `NotFound` if nothing announced `T` yet.
    pub fn get<T>(&self) -> Result<Arc<T>, ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.state.lock().view().get::<T>()
    }

    #[must_use]
    pub fn contains(&self, key: CapabilityKey) -> bool {
        self.state.lock().view().contains(key)
    }

    /// Parked requests, in registration order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingInfo> {
        let r = self.state.lock();
        r.pending
            .iter()
            .map(|p| PendingInfo {
                owner: p.owner.clone(),
                missing: r.missing(&p.required),
            })
            .collect()
    }

    /// Number of announced capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        let r = self.state.lock();
        r.modules.len() + r.default_modules.len() + r.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Storage: Send + Sync {
        fn id(&self) -> usize;
    }

    trait Clock: Send + Sync {
        fn now(&self) -> u64;
    }

    struct MemStorage(usize);
    impl Storage for MemStorage {
        fn id(&self) -> usize {
            self.0
        }
    }

    struct FixedClock(u64);
    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    struct LoggerReady;

    #[test]
    fn resolves_immediately_when_everything_is_known() {
        let resolver = CapabilityResolver::new();
        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(7)));

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let outcome = resolver
            .request::<Arc<dyn Storage>, _>(Some("consumer"), move |storage| {
                s.store(storage.id(), Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(outcome, Resolution::Resolved);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(resolver.pending().is_empty());
    }

    #[test]
    fn deferred_request_fires_once_after_both_types_arrive() {
        let resolver = CapabilityResolver::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let outcome = resolver
            .request::<(Arc<dyn Storage>, Arc<dyn Clock>), _>(Some("consumer"), move |(s, c)| {
                assert_eq!(s.id(), 1);
                assert_eq!(c.now(), 42);
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(matches!(outcome, Resolution::Deferred { ref missing } if missing.len() == 2));

        // Clock first, then storage: announce order is irrelevant.
        resolver.add_feature::<dyn Clock>(Arc::new(FixedClock(42)));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "still missing storage");
        assert_eq!(resolver.pending().len(), 1);

        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(resolver.pending().is_empty());

        // Further announcements must not re-fire the resolved request.
        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(2)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn binds_by_type_not_by_required_order() {
        let resolver = CapabilityResolver::new();
        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(3)));
        resolver.add_feature::<dyn Clock>(Arc::new(FixedClock(9)));

        let required = [
            CapabilityKey::of::<dyn Storage>(),
            CapabilityKey::of::<dyn Clock>(),
        ];
        let got = Arc::new(parking_lot::Mutex::new(None));
        let g = got.clone();
        resolver
            .request_capabilities::<(Arc<dyn Clock>, Arc<dyn Storage>), _>(
                None,
                &required,
                move |(clock, storage)| {
                    *g.lock() = Some((clock.now(), storage.id()));
                },
            )
            .unwrap();

        assert_eq!(*got.lock(), Some((9, 3)));
    }

    #[test]
    fn marker_barrier_delays_callback() {
        let resolver = CapabilityResolver::new();
        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(5)));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let required = [
            CapabilityKey::of::<dyn Storage>(),
            CapabilityKey::of::<LoggerReady>(),
        ];
        let outcome = resolver
            .request_capabilities::<Arc<dyn Storage>, _>(Some("worker"), &required, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(
            outcome,
            Resolution::Deferred {
                missing: vec![CapabilityKey::of::<LoggerReady>()]
            }
        );
        let pending = resolver.pending();
        assert_eq!(pending[0].owner.as_deref(), Some("worker"));

        resolver.add_feature(Arc::new(LoggerReady));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undeclared_callback_parameter_is_rejected_immediately() {
        let resolver = CapabilityResolver::new();
        let required = [CapabilityKey::of::<dyn Storage>()];

        let err = resolver
            .request_capabilities::<(Arc<dyn Storage>, Arc<dyn Clock>), _>(None, &required, |_| {})
            .unwrap_err();

        match err {
            ResolveError::UndeclaredParameter { key } => {
                assert!(key.name().contains("Clock"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(resolver.pending().is_empty(), "misconfigured request must not be parked");
    }

    #[test]
    fn modules_win_over_default_modules_and_features() {
        let resolver = CapabilityResolver::new();
        resolver.add_feature::<MemStorage>(Arc::new(MemStorage(3)));
        resolver.announce_module(ModuleTier::Default, Arc::from("dflt"), Arc::new(MemStorage(2)));
        resolver.announce_module(ModuleTier::User, Arc::from("user"), Arc::new(MemStorage(1)));

        assert_eq!(resolver.get::<MemStorage>().unwrap().id(), 1);
        assert_eq!(resolver.len(), 3);
    }

    #[test]
    fn get_returns_not_found_for_unknown_type() {
        let resolver = CapabilityResolver::new();
        match resolver.get::<dyn Storage>() {
            Err(ResolveError::NotFound { key }) => {
                assert!(format!("{key:?}").contains("Storage"));
            }
            _ => panic!("Expected NotFound error"),
        }
    }

    #[test]
    fn callback_may_announce_further_capabilities() {
        let resolver = Arc::new(CapabilityResolver::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        resolver
            .request::<Arc<dyn Clock>, _>(Some("late"), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let r = resolver.clone();
        resolver
            .request::<Arc<dyn Storage>, _>(Some("chain"), move |_| {
                r.add_feature::<dyn Clock>(Arc::new(FixedClock(1)));
            })
            .unwrap();

        resolver.add_feature::<dyn Storage>(Arc::new(MemStorage(0)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(resolver.pending().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_announcements_fire_each_request_exactly_once() {
        struct Marker<const N: usize>;

        let resolver = Arc::new(CapabilityResolver::new());
        let counters: Vec<Arc<AtomicUsize>> =
            (0..32).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for c in &counters {
            let c = c.clone();
            let required = [
                CapabilityKey::of::<Marker<0>>(),
                CapabilityKey::of::<Marker<1>>(),
                CapabilityKey::of::<Marker<2>>(),
                CapabilityKey::of::<Marker<3>>(),
            ];
            resolver
                .request_capabilities::<(), _>(None, &required, move |()| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let mut handles = vec![];
        for i in 0..4 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    match i {
                        0 => r.add_feature(Arc::new(Marker::<0>)),
                        1 => r.add_feature(Arc::new(Marker::<1>)),
                        2 => r.add_feature(Arc::new(Marker::<2>)),
                        _ => r.add_feature(Arc::new(Marker::<3>)),
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
        assert!(resolver.pending().is_empty());
    }
}
