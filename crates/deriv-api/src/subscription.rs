//! Subscription tracking: dedup by canonical key, reuse by derived key,
//! multicast fan-out and teardown.
//!
//! Each tracked request owns one [`Source`]. Every consumer attached to a
//! source gets its own cursor on a broadcast channel, preceded by a replay
//! of the latest message so consumers that attach after the first response
//! still see it. Completing a source drops the sender, which ends every
//! consumer's stream without an error.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use deriv_core::{
    ApiError, CanonicalKey, ClosureCause, ReqId, Request, ResponseError, Result, SubscriptionId,
    wire,
};

/// Item yielded by a subscription stream.
///
/// Data messages (including error objects the server sends after the
/// subscription is established) arrive as `Ok`. An `Err` is yielded when
/// this consumer fell so far behind that messages were dropped for it, and
/// once right before the stream ends because the connection failed.
pub type StreamItem = Result<Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Secondary keys
// ─────────────────────────────────────────────────────────────────────────────

/// Derives an alternate key under which a later request may reuse a stream.
pub trait SecondaryKeyPolicy: Send + Sync + 'static {
    /// Key for `request`'s stream, given its first successful response.
    fn derive(&self, request: &Request, response: &Value) -> Option<CanonicalKey>;
}

/// Lets a plain contract watch reuse the stream opened by a `buy` call.
///
/// A `buy` response carrying `buy.contract_id` is registered under the key
/// of `{"proposal_open_contract": 1, "contract_id": <id>}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContractReusePolicy;

impl SecondaryKeyPolicy for ContractReusePolicy {
    fn derive(&self, request: &Request, response: &Value) -> Option<CanonicalKey> {
        if !request.contains_key("buy") {
            return None;
        }
        let contract_id = response.get("buy")?.get("contract_id")?;
        if contract_id.is_null() {
            return None;
        }
        let watch = json!({"proposal_open_contract": 1, "contract_id": contract_id});
        watch.as_object().map(CanonicalKey::of)
    }
}

/// Never derives a secondary key.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSecondaryKeys;

impl SecondaryKeyPolicy for NoSecondaryKeys {
    fn derive(&self, _request: &Request, _response: &Value) -> Option<CanonicalKey> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a source as seen by concurrent subscribers.
#[derive(Clone, Debug)]
enum Phase {
    /// Waiting for the first response.
    Pending,
    /// First response recorded; routing by subscription id.
    Live,
    /// Rejected before going live, or torn down by a connection failure.
    Failed(ApiError),
    /// The establishing caller went away before the first response.
    Cancelled,
    /// Ended without an error.
    Completed,
}

struct Feed {
    sender: Option<broadcast::Sender<StreamItem>>,
    latest: Option<Value>,
    terminal: Option<ApiError>,
    sub_id: Option<SubscriptionId>,
}

/// One multicast source, shared by every subscriber of the same key.
struct Source {
    key: CanonicalKey,
    request: Request,
    category: Option<String>,
    feed: Mutex<Feed>,
    phase: watch::Sender<Phase>,
}

impl Source {
    fn new(key: CanonicalKey, request: Request, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let category = wire::request_category(&request).map(String::from);
        let (phase, _) = watch::channel(Phase::Pending);
        Self {
            key,
            request,
            category,
            feed: Mutex::new(Feed {
                sender: Some(sender),
                latest: None,
                terminal: None,
                sub_id: None,
            }),
            phase,
        }
    }

    fn publish(&self, msg: &Value) {
        let mut feed = self.feed.lock();
        feed.latest = Some(msg.clone());
        if let Some(sender) = &feed.sender {
            let _ = sender.send(Ok(msg.clone()));
        }
    }

    fn go_live(&self, sub_id: SubscriptionId, msg: &Value) {
        self.feed.lock().sub_id = Some(sub_id);
        self.publish(msg);
        let _ = self.phase.send_replace(Phase::Live);
    }

    fn complete(&self) {
        let _ = self.feed.lock().sender.take();
        let _ = self.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Failed(_) | Phase::Completed | Phase::Cancelled) {
                return false;
            }
            *phase = Phase::Completed;
            true
        });
    }

    fn fail(&self, err: ApiError) {
        {
            let mut feed = self.feed.lock();
            if let Some(sender) = feed.sender.take() {
                let _ = sender.send(Err(err.clone()));
            }
            feed.terminal = Some(err.clone());
        }
        let _ = self.phase.send_replace(Phase::Failed(err));
    }

    fn cancel(&self) {
        let _ = self.feed.lock().sender.take();
        let _ = self.phase.send_replace(Phase::Cancelled);
    }

    fn is_pending(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Pending)
    }

    fn sub_id(&self) -> Option<SubscriptionId> {
        self.feed.lock().sub_id.clone()
    }

    fn attach(&self) -> BoxStream<'static, StreamItem> {
        let feed = self.feed.lock();
        let replay = stream::iter(feed.latest.clone().map(Ok));
        match &feed.sender {
            Some(sender) => {
                let key = self.key.clone();
                let live = BroadcastStream::new(sender.subscribe()).map(move |item| match item {
                    Ok(item) => item,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "subscription consumer lagged");
                        Err(ApiError::Api(format!(
                            "subscription consumer lagged, {skipped} messages skipped"
                        )))
                    }
                });
                replay.chain(live).boxed()
            }
            None => replay
                .chain(stream::iter(feed.terminal.clone().map(Err)))
                .boxed(),
        }
    }

    async fn ready(&self) -> Result<bool> {
        let mut rx = self.phase.subscribe();
        loop {
            let outcome = match &*rx.borrow_and_update() {
                Phase::Pending => None,
                Phase::Live | Phase::Completed => Some(Ok(true)),
                Phase::Cancelled => Some(Ok(false)),
                Phase::Failed(err) => Some(Err(err.clone())),
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ApiError::Api(format!("subscription {} abandoned", self.key)));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a shared subscription stream.
///
/// Clones and repeated subscribes of the same request compare equal: they
/// share one source and one server-side subscription.
#[derive(Clone)]
pub struct Subscription {
    source: Arc<Source>,
}

impl Subscription {
    /// Canonical key of the originating request.
    pub fn key(&self) -> &CanonicalKey {
        &self.source.key
    }

    /// Originating request.
    pub fn request(&self) -> &Request {
        &self.source.request
    }

    /// Server-assigned subscription id, once the first response arrived.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.source.sub_id()
    }

    /// Whether the stream still delivers messages.
    pub fn is_active(&self) -> bool {
        self.source.feed.lock().sender.is_some()
    }

    /// Number of attached consumers.
    pub fn consumers(&self) -> usize {
        self.source
            .feed
            .lock()
            .sender
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Attach a new consumer.
    ///
    /// The latest message is replayed first, then every later one in order.
    /// A consumer that falls more than the stream buffer behind gets one
    /// `Err` item saying how many messages it missed, then resumes with the
    /// oldest message still buffered. Dropping the stream detaches this
    /// consumer only.
    pub fn stream(&self) -> BoxStream<'static, StreamItem> {
        self.source.attach()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.source.key)
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Result of [`SubscriptionManager::attach_or_create`].
#[derive(Debug)]
pub enum Attachment {
    /// A source already exists for the key; nothing needs transmitting.
    Existing(Subscription),
    /// A new pending source was created; the caller must establish it.
    Created(Subscription),
}

#[derive(Default)]
struct Registry {
    entries: HashMap<CanonicalKey, Arc<Source>>,
    by_req: HashMap<ReqId, CanonicalKey>,
    by_sub: HashMap<SubscriptionId, CanonicalKey>,
    secondary: HashMap<CanonicalKey, CanonicalKey>,
    stray: HashSet<SubscriptionId>,
    closed: Option<ClosureCause>,
}

impl Registry {
    fn lookup(&self, key: &CanonicalKey) -> Option<&Arc<Source>> {
        self.entries.get(key).or_else(|| {
            self.secondary
                .get(key)
                .and_then(|primary| self.entries.get(primary))
        })
    }

    fn remove(&mut self, key: &CanonicalKey) -> Option<Arc<Source>> {
        let source = self.entries.remove(key)?;
        self.by_req.retain(|_, k| k != key);
        self.by_sub.retain(|_, k| k != key);
        self.secondary.retain(|_, k| k != key);
        Some(source)
    }
}

/// Owns every tracked subscription and its indices.
pub struct SubscriptionManager {
    registry: Mutex<Registry>,
    policy: Arc<dyn SecondaryKeyPolicy>,
    capacity: usize,
}

impl SubscriptionManager {
    /// Create a manager whose streams buffer `capacity` undelivered messages
    /// per consumer.
    pub fn new(policy: Arc<dyn SecondaryKeyPolicy>, capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            policy,
            capacity,
        }
    }

    /// Find the source for `request` by primary or secondary key, or create
    /// a pending one.
    pub fn attach_or_create(&self, request: &Request) -> Result<Attachment> {
        let key = CanonicalKey::of(request);
        let mut registry = self.registry.lock();
        if let Some(cause) = &registry.closed {
            return Err(cause.clone().into());
        }
        if let Some(source) = registry.lookup(&key) {
            debug!(key = %key, "reusing subscription");
            return Ok(Attachment::Existing(Subscription {
                source: Arc::clone(source),
            }));
        }
        let source = Arc::new(Source::new(key.clone(), request.clone(), self.capacity));
        let _ = registry.entries.insert(key, Arc::clone(&source));
        Ok(Attachment::Created(Subscription { source }))
    }

    /// Wait until `subscription` went live, completed or failed.
    ///
    /// `Ok(false)` means the caller establishing it went away first; the
    /// source is gone and the request should be attached again.
    pub async fn ready(&self, subscription: &Subscription) -> Result<bool> {
        subscription.source.ready().await
    }

    /// Associate the establishing call's correlation id with its source.
    pub fn bind_request(&self, key: &CanonicalKey, id: ReqId) {
        let _ = self.registry.lock().by_req.insert(id, key.clone());
    }

    /// Drop the binding of an establishing call that will never be resolved.
    pub fn unbind_request(&self, id: ReqId) {
        let _ = self.registry.lock().by_req.remove(&id);
    }

    /// Discard `subscription` if it is still waiting for its first response.
    ///
    /// Used when the establishing caller is dropped. Concurrent subscribers
    /// waiting on it are told to attach again. Live, completed and failed
    /// sources are left alone.
    pub fn abandon_pending(&self, subscription: &Subscription) {
        let mut registry = self.registry.lock();
        let current = registry
            .entries
            .get(subscription.key())
            .is_some_and(|source| Arc::ptr_eq(source, &subscription.source));
        if current && subscription.source.is_pending() {
            debug!(key = %subscription.key(), "establishing call cancelled");
            let _ = registry.remove(subscription.key());
            subscription.source.cancel();
        }
    }

    /// Discard a source that could not be established.
    ///
    /// No-op if the source was already removed, so a newer source created
    /// under the same key is left alone.
    pub fn abandon(&self, subscription: &Subscription, err: ApiError) {
        let removed = {
            let mut registry = self.registry.lock();
            let current = registry
                .entries
                .get(subscription.key())
                .is_some_and(|source| Arc::ptr_eq(source, &subscription.source));
            if current {
                registry.remove(subscription.key())
            } else {
                None
            }
        };
        if let Some(source) = removed {
            source.fail(err);
        }
    }

    /// Handle the response to an establishing call.
    ///
    /// Returns `false` when `id` did not establish a subscription. The
    /// source's phase changes under the registry lock, so a concurrent
    /// [`abandon_pending`](Self::abandon_pending) sees either a pending
    /// source or a settled one.
    pub fn first_response(&self, id: ReqId, msg: &Value) -> bool {
        let sub_id = wire::subscription_id(msg);
        let mut registry = self.registry.lock();
        let Some(key) = registry.by_req.remove(&id) else {
            return false;
        };
        let Some(source) = registry.entries.get(&key).cloned() else {
            return true;
        };

        if let Some(err) = ResponseError::from_response(msg).filter(|_| sub_id.is_none()) {
            debug!(key = %key, code = %err.code, "subscription rejected");
            let _ = registry.remove(&key);
            source.fail(err.into());
            return true;
        }

        match sub_id {
            Some(sub_id) => {
                let previous = registry.by_sub.get(&sub_id).filter(|k| **k != key).cloned();
                if let Some(replaced) = previous.and_then(|k| registry.remove(&k)) {
                    warn!(
                        subscription = %sub_id,
                        key = %replaced.key,
                        "subscription id reused, completing older stream"
                    );
                    replaced.complete();
                }
                if let Some(secondary) = self.policy.derive(&source.request, msg) {
                    let _ = registry.secondary.insert(secondary, key.clone());
                }
                let _ = registry.by_sub.insert(sub_id.clone(), key);
                debug!(subscription = %sub_id, "subscription live");
                source.go_live(sub_id, msg);
            }
            None => {
                let _ = registry.remove(&key);
                source.publish(msg);
                source.complete();
            }
        }
        true
    }

    /// Deliver `msg` to the source holding `sub_id`.
    ///
    /// Returns `false` when no live source holds it.
    pub fn route(&self, sub_id: &SubscriptionId, msg: &Value) -> bool {
        let source = {
            let registry = self.registry.lock();
            registry
                .by_sub
                .get(sub_id)
                .and_then(|key| registry.entries.get(key))
                .cloned()
        };
        match source {
            Some(source) => {
                source.publish(msg);
                true
            }
            None => false,
        }
    }

    /// Remove the source holding `sub_id` from every index and complete it.
    ///
    /// Returns `false` when nothing local held the id.
    pub fn remove_by_id(&self, sub_id: &SubscriptionId) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            let key = registry.by_sub.get(sub_id).cloned();
            key.and_then(|key| registry.remove(&key))
        };
        match removed {
            Some(source) => {
                source.complete();
                true
            }
            None => false,
        }
    }

    /// Subscription ids of every live source whose request has `category`.
    pub fn ids_for_category(&self, category: &str) -> Vec<SubscriptionId> {
        let registry = self.registry.lock();
        registry
            .entries
            .values()
            .filter(|source| source.category.as_deref() == Some(category))
            .filter_map(|source| source.sub_id())
            .collect()
    }

    /// Existing subscription for `request`, if any.
    pub fn find(&self, request: &Request) -> Option<Subscription> {
        let key = CanonicalKey::of(request);
        self.registry
            .lock()
            .lookup(&key)
            .map(|source| Subscription {
                source: Arc::clone(source),
            })
    }

    /// Record an unsubscribe in flight for a stray id.
    ///
    /// Returns `false` if one is already in flight.
    pub fn mark_stray(&self, sub_id: &SubscriptionId) -> bool {
        self.registry.lock().stray.insert(sub_id.clone())
    }

    /// Forget a stray id once its unsubscribe finished.
    pub fn clear_stray(&self, sub_id: &SubscriptionId) {
        let _ = self.registry.lock().stray.remove(sub_id);
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Whether no source is tracked.
    pub fn is_empty(&self) -> bool {
        self.registry.lock().entries.is_empty()
    }

    /// Number of secondary keys currently mapped.
    pub fn secondary_len(&self) -> usize {
        self.registry.lock().secondary.len()
    }

    /// Refuse new subscriptions and end every stream with `cause`.
    ///
    /// Returns the number of streams torn down.
    pub fn close(&self, cause: &ClosureCause) -> usize {
        let (recorded, sources) = {
            let mut registry = self.registry.lock();
            let recorded = registry.closed.get_or_insert_with(|| cause.clone()).clone();
            registry.by_req.clear();
            registry.by_sub.clear();
            registry.secondary.clear();
            registry.stray.clear();
            let sources: Vec<Arc<Source>> =
                registry.entries.drain().map(|(_, source)| source).collect();
            (recorded, sources)
        };
        let count = sources.len();
        for source in sources {
            source.fail(ApiError::Connection(recorded.clone()));
        }
        count
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("SubscriptionManager")
            .field("entries", &registry.entries.len())
            .field("secondary", &registry.secondary.len())
            .field("closed", &registry.closed)
            .finish_non_exhaustive()
    }
}
