//! The dual-keyed object cache: UUID-primary, name-secondary.
//!
//! `by_uuid` is the authoritative index; every cached handle lives there.
//! `by_name` maps `(kind, name)` to the set of UUIDs observed under that
//! name and exists to surface ambiguity, never to hide it. The two indexes
//! mutate together under one lock so no reader observes a handle reachable
//! by name but not by UUID.
//!
//! Backend lookups for the same key coalesce: the first caller fetches,
//! everyone else who arrives mid-flight waits on a channel and receives the
//! same outcome, success or failure.

use crate::error::InventoryError;
use crate::handle::ManagedObjectHandle;
use crate::session::Session;
use crate::types::{EntityKind, EntityRecord, Uuid};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

type ResolveResult = Result<ManagedObjectHandle, InventoryError>;

/// Per-call resolution knobs. The default trusts any cached handle and
/// waits on the backend indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Cached handles older than this are re-fetched instead of returned.
    pub max_age: Option<Duration>,
    /// Upper bound on waiting for the backend, whether this call performs
    /// the fetch itself or joins one already in flight.
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct CacheState {
    by_uuid: HashMap<Uuid, ManagedObjectHandle>,
    by_name: HashMap<(EntityKind, String), BTreeSet<Uuid>>,
}

impl CacheState {
    /// Insert into both indexes. An overwrite that reveals a rename also
    /// unlinks the UUID from its previous name bucket.
    fn insert(&mut self, handle: ManagedObjectHandle) {
        let uuid = handle.uuid().clone();
        let name_key = (handle.kind(), handle.name().to_string());
        if let Some(previous) = self.by_uuid.insert(uuid.clone(), handle) {
            if previous.kind() != name_key.0 || previous.name() != name_key.1 {
                self.unlink_name(previous.kind(), previous.name(), &uuid);
            }
        }
        self.by_name.entry(name_key).or_default().insert(uuid);
    }

    fn remove(&mut self, uuid: &Uuid) -> Option<ManagedObjectHandle> {
        match self.by_uuid.remove(uuid) {
            Some(handle) => {
                self.unlink_name(handle.kind(), handle.name(), uuid);
                Some(handle)
            }
            None => None,
        }
    }

    fn unlink_name(&mut self, kind: EntityKind, name: &str, uuid: &Uuid) {
        let key = (kind, name.to_string());
        if let Some(bucket) = self.by_name.get_mut(&key) {
            bucket.remove(uuid);
            if bucket.is_empty() {
                self.by_name.remove(&key);
            }
        }
    }
}

/// What the secondary index knows about a `(kind, name)` pair.
enum NameLookup {
    Unique(Uuid),
    Ambiguous(Vec<Uuid>),
    Miss,
}

/// Key of one in-flight backend resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    ByUuid(EntityKind, Uuid),
    ByName(EntityKind, String),
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingKey::ByUuid(kind, uuid) => write!(f, "{} {}", kind, uuid),
            PendingKey::ByName(kind, name) => write!(f, "{} '{}'", kind, name),
        }
    }
}

struct PendingFetch {
    waiters: Vec<oneshot::Sender<ResolveResult>>,
}

/// Removes the pending entry when the leading fetch completes, including
/// when the leader's future is dropped mid-flight. Abandoned waiters then
/// see their channel close instead of hanging.
struct InFlight<'a> {
    cache: &'a ObjectCache,
    key: Option<PendingKey>,
}

impl InFlight<'_> {
    fn complete(mut self) -> Vec<oneshot::Sender<ResolveResult>> {
        match self.key.take() {
            Some(key) => self
                .cache
                .pending
                .lock()
                .remove(&key)
                .map(|entry| entry.waiters)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.pending.lock().remove(&key);
        }
    }
}

/// Session-scoped cache of resolved handles.
pub struct ObjectCache {
    session: Arc<Session>,
    state: RwLock<CacheState>,
    pending: Mutex<HashMap<PendingKey, PendingFetch>>,
}

impl ObjectCache {
    pub fn new(session: Arc<Session>) -> Self {
        ObjectCache {
            session,
            state: RwLock::new(CacheState::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolve by identifier shape: canonical-UUID strings go through the
    /// primary index, everything else is treated as a name.
    pub async fn resolve(&self, kind: EntityKind, identifier: &str) -> ResolveResult {
        self.resolve_with(kind, identifier, ResolveOptions::default())
            .await
    }

    pub async fn resolve_with(
        &self,
        kind: EntityKind,
        identifier: &str,
        opts: ResolveOptions,
    ) -> ResolveResult {
        if Uuid::is_canonical(identifier) {
            self.resolve_by_uuid(kind, &Uuid::from(identifier), opts).await
        } else {
            self.resolve_by_name(kind, identifier, opts).await
        }
    }

    pub async fn resolve_by_uuid(
        &self,
        kind: EntityKind,
        uuid: &Uuid,
        opts: ResolveOptions,
    ) -> ResolveResult {
        if let Some(handle) = self.cached_by_uuid(kind, uuid, &opts)? {
            trace!(kind = %kind, uuid = %uuid, "Cache hit by UUID");
            return Ok(handle);
        }
        self.fetch_coalesced(PendingKey::ByUuid(kind, uuid.clone()), opts)
            .await
    }

    pub async fn resolve_by_name(
        &self,
        kind: EntityKind,
        name: &str,
        opts: ResolveOptions,
    ) -> ResolveResult {
        match self.lookup_name(kind, name) {
            NameLookup::Unique(uuid) => {
                trace!(kind = %kind, name, "Name is uniquely bound; resolving by UUID");
                self.resolve_by_uuid(kind, &uuid, opts).await
            }
            NameLookup::Ambiguous(candidates) => {
                debug!(
                    kind = %kind,
                    name,
                    matches = candidates.len(),
                    "Cached name bucket is ambiguous"
                );
                Err(InventoryError::AmbiguousName {
                    kind,
                    name: name.to_string(),
                    candidates,
                })
            }
            NameLookup::Miss => {
                self.fetch_coalesced(PendingKey::ByName(kind, name.to_string()), opts)
                    .await
            }
        }
    }

    /// Enumerate every entity of `kind` and cache all of them, overwriting
    /// any stale handles. Returns how many the backend reported.
    pub async fn preload_all(&self, kind: EntityKind) -> Result<usize, InventoryError> {
        debug!(kind = %kind, "Preloading inventory");
        let records = self.session.inventory().enumerate_all(kind).await?;
        let count = records.len();
        {
            let mut state = self.state.write();
            for record in records {
                state.insert(ManagedObjectHandle::from_record(kind, record));
            }
        }
        info!(kind = %kind, count, "Inventory preloaded");
        Ok(count)
    }

    /// Force a re-fetch of a cached entity. An entity the backend no longer
    /// knows is evicted from both indexes before the error surfaces.
    pub async fn refresh(&self, uuid: &Uuid) -> ResolveResult {
        let kind = {
            let state = self.state.read();
            match state.by_uuid.get(uuid) {
                Some(handle) => handle.kind(),
                None => {
                    return Err(InventoryError::EntityNotFound(format!(
                        "{} is not cached; resolve it before refreshing",
                        uuid
                    )))
                }
            }
        };
        debug!(kind = %kind, uuid = %uuid, "Refreshing cached entity");
        match self.session.inventory().fetch_by_uuid(kind, uuid).await? {
            Some(record) => Ok(self.store(kind, record)),
            None => {
                self.state.write().remove(uuid);
                warn!(kind = %kind, uuid = %uuid, "Entity is gone from the backend; evicting");
                Err(InventoryError::EntityNotFound(format!(
                    "{} {} is gone from the backend",
                    kind, uuid
                )))
            }
        }
    }

    /// Drop a handle from both indexes without touching the backend.
    pub fn invalidate(&self, uuid: &Uuid) -> bool {
        match self.state.write().remove(uuid) {
            Some(handle) => {
                debug!(
                    kind = %handle.kind(),
                    uuid = %uuid,
                    name = handle.name(),
                    "Invalidated cache entry"
                );
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every cached handle, in UUID order. Later
    /// cache mutations do not reach a snapshot already taken.
    pub fn snapshot(&self) -> Snapshot {
        let mut handles: Vec<ManagedObjectHandle> = {
            let state = self.state.read();
            state.by_uuid.values().cloned().collect()
        };
        handles.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        Snapshot {
            taken_at: Utc::now(),
            inner: handles.into_iter(),
        }
    }

    /// Current handle for `uuid`, if one is cached. No backend traffic,
    /// no kind or staleness checks; resolution goes through `resolve`.
    pub fn peek(&self, uuid: &Uuid) -> Option<ManagedObjectHandle> {
        self.state.read().by_uuid.get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().by_uuid.is_empty()
    }

    // Internals -----------------------------------------------------------

    fn cached_by_uuid(
        &self,
        kind: EntityKind,
        uuid: &Uuid,
        opts: &ResolveOptions,
    ) -> Result<Option<ManagedObjectHandle>, InventoryError> {
        let state = self.state.read();
        let handle = match state.by_uuid.get(uuid) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        if handle.kind() != kind {
            return Err(InventoryError::KindMismatch {
                uuid: uuid.clone(),
                requested: kind,
                actual: handle.kind(),
            });
        }
        if let Some(max_age) = opts.max_age {
            if handle.age() > max_age {
                debug!(kind = %kind, uuid = %uuid, "Cached handle exceeds caller staleness bound");
                return Ok(None);
            }
        }
        Ok(Some(handle.clone()))
    }

    fn lookup_name(&self, kind: EntityKind, name: &str) -> NameLookup {
        let state = self.state.read();
        match state.by_name.get(&(kind, name.to_string())) {
            Some(bucket) if bucket.len() >= 2 => {
                NameLookup::Ambiguous(bucket.iter().cloned().collect())
            }
            Some(bucket) => match bucket.iter().next() {
                Some(uuid) => NameLookup::Unique(uuid.clone()),
                None => NameLookup::Miss,
            },
            None => NameLookup::Miss,
        }
    }

    fn recheck_cached(
        &self,
        key: &PendingKey,
        opts: &ResolveOptions,
    ) -> Result<Option<ManagedObjectHandle>, InventoryError> {
        match key {
            PendingKey::ByUuid(kind, uuid) => self.cached_by_uuid(*kind, uuid, opts),
            PendingKey::ByName(kind, name) => match self.lookup_name(*kind, name) {
                NameLookup::Unique(uuid) => self.cached_by_uuid(*kind, &uuid, opts),
                NameLookup::Ambiguous(candidates) => Err(InventoryError::AmbiguousName {
                    kind: *kind,
                    name: name.clone(),
                    candidates,
                }),
                NameLookup::Miss => Ok(None),
            },
        }
    }

    /// Either lead the backend fetch for `key` or join one already running.
    async fn fetch_coalesced(&self, key: PendingKey, opts: ResolveOptions) -> ResolveResult {
        let rx = {
            let mut pending = self.pending.lock();
            // A leader may have landed this entry between our cache miss
            // and taking the pending lock.
            if let Some(handle) = self.recheck_cached(&key, &opts)? {
                return Ok(handle);
            }
            match pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().waiters.push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(PendingFetch {
                        waiters: Vec::new(),
                    });
                    None
                }
            }
        };
        match rx {
            Some(rx) => self.await_shared(key, rx, opts).await,
            None => self.lead_fetch(key, opts).await,
        }
    }

    async fn await_shared(
        &self,
        key: PendingKey,
        rx: oneshot::Receiver<ResolveResult>,
        opts: ResolveOptions,
    ) -> ResolveResult {
        debug!(entity = %key, "Joining in-flight resolution");
        let outcome = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(InventoryError::Timeout(format!(
                        "resolution of {} exceeded {:?}",
                        key, limit
                    )))
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result,
            Err(_) => Err(InventoryError::BackendUnavailable(
                "in-flight resolution was abandoned".to_string(),
            )),
        }
    }

    async fn lead_fetch(&self, key: PendingKey, opts: ResolveOptions) -> ResolveResult {
        let in_flight = InFlight {
            cache: self,
            key: Some(key.clone()),
        };
        let result = self.fetch_and_store(&key, &opts).await;
        for waiter in in_flight.complete() {
            // A waiter that gave up stopped listening; nothing to do.
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn fetch_and_store(&self, key: &PendingKey, opts: &ResolveOptions) -> ResolveResult {
        match key {
            PendingKey::ByUuid(kind, uuid) => {
                debug!(kind = %kind, uuid = %uuid, "Fetching entity by UUID");
                let fetched = self
                    .bounded(key, opts, self.session.inventory().fetch_by_uuid(*kind, uuid))
                    .await?;
                match fetched {
                    Some(record) => Ok(self.store(*kind, record)),
                    None => Err(InventoryError::EntityNotFound(format!(
                        "{} {}",
                        kind, uuid
                    ))),
                }
            }
            PendingKey::ByName(kind, name) => {
                debug!(kind = %kind, name = %name, "Scanning for entity by name");
                let mut records = self
                    .bounded(key, opts, self.session.inventory().find_by_name(*kind, name))
                    .await?;
                match records.len() {
                    0 => Err(InventoryError::EntityNotFound(format!(
                        "{} named '{}'",
                        kind, name
                    ))),
                    1 => Ok(self.store(*kind, records.remove(0))),
                    matches => {
                        let mut candidates: Vec<Uuid> =
                            records.into_iter().map(|r| r.uuid).collect();
                        candidates.sort();
                        warn!(
                            kind = %kind,
                            name = %name,
                            matches,
                            "Name is ambiguous; caching nothing"
                        );
                        Err(InventoryError::AmbiguousName {
                            kind: *kind,
                            name: name.clone(),
                            candidates,
                        })
                    }
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        key: &PendingKey,
        opts: &ResolveOptions,
        fetch: impl Future<Output = Result<T, InventoryError>>,
    ) -> Result<T, InventoryError> {
        match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => Err(InventoryError::Timeout(format!(
                    "backend lookup for {} exceeded {:?}",
                    key, limit
                ))),
            },
            None => fetch.await,
        }
    }

    fn store(&self, kind: EntityKind, record: EntityRecord) -> ManagedObjectHandle {
        let handle = ManagedObjectHandle::from_record(kind, record);
        self.state.write().insert(handle.clone());
        handle
    }
}

/// Point-in-time view of the cache. Yields each handle once; exhausted
/// snapshots stay exhausted.
pub struct Snapshot {
    taken_at: DateTime<Utc>,
    inner: std::vec::IntoIter<ManagedObjectHandle>,
}

impl Snapshot {
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

impl Iterator for Snapshot {
    type Item = ManagedObjectHandle;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Snapshot {}
