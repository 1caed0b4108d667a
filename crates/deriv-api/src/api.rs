//! The engine facade.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use deriv_core::{ApiError, ClosureCause, ReqId, Request, Result, SubscriptionId, wire};
use deriv_settings::DerivSettings;

use crate::cache::{ResponseCache, ResponseFuture};
use crate::channels::{ApiEvent, Broadcast};
use crate::config::EngineConfig;
use crate::correlator::Correlator;
use crate::dispatcher;
use crate::subscription::{Attachment, Subscription, SubscriptionManager};
use crate::tasks::TaskRegistry;
use crate::transport::Transport;
use crate::ws::WsTransport;

/// Reason recorded by [`DerivApi::disconnect`].
pub const DISCONNECT_REASON: &str = "Closed by disconnect";
/// Reason recorded by [`DerivApi::clear`].
pub const CLEAR_REASON: &str = "Closed by clear";

/// Shared engine state. The reader task only holds a weak reference.
pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) correlator: Correlator,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) cache: ResponseCache,
    pub(crate) errors: Broadcast<ApiError>,
    pub(crate) events: Broadcast<ApiEvent>,
    pub(crate) tasks: TaskRegistry,
    closure: Mutex<Option<ClosureCause>>,
    reader_cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Stamp a correlation id on `request`, transmit it and wait for the reply.
    ///
    /// `establishes` binds the id to a pending subscription before the
    /// request leaves, so the dispatcher can recognize its first response.
    /// Dropping the returned future releases the correlation slot and the
    /// binding, so a reply that still arrives is treated as unsolicited.
    async fn call(&self, mut request: Request, establishes: Option<&Subscription>) -> Result<Value> {
        let call = self.correlator.register()?;
        let id = call.id();
        let _release = CallRelease { inner: self, id };
        if let Some(subscription) = establishes {
            self.subscriptions.bind_request(subscription.key(), id);
        }
        let _ = request.insert(wire::REQ_ID.to_string(), Value::from(id.get()));
        let payload = Value::Object(request);

        self.transmit(id, &payload).await?;
        self.events.publish(ApiEvent::Sent(payload));
        call.wait().await
    }

    async fn transmit(&self, id: ReqId, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)
            .map_err(|e| ApiError::Api(format!("cannot serialize request {id}: {e}")))?;
        debug!(req_id = %id, "sending request");
        self.transport.send(text).await
    }

    pub(crate) async fn forget(&self, sub_id: &SubscriptionId) -> Result<bool> {
        if self.subscriptions.remove_by_id(sub_id) {
            debug!(subscription = %sub_id, "completed local stream");
        }
        let mut request = Request::new();
        let _ = request.insert(wire::FORGET.to_string(), Value::from(sub_id.as_str()));
        let outcome = self.call(request, None).await;
        self.subscriptions.clear_stray(sub_id);

        let response = outcome?;
        Ok(match response.get(wire::FORGET) {
            Some(Value::Bool(found)) => *found,
            Some(found) => found.as_u64() == Some(1),
            None => false,
        })
    }

    /// Mark the connection failed and fail everything waiting on it.
    ///
    /// The first cause recorded wins; later calls only drain what is left.
    pub(crate) fn fail(&self, cause: ClosureCause) {
        let (recorded, first) = {
            let mut closure = self.closure.lock();
            match &*closure {
                Some(existing) => (existing.clone(), false),
                None => {
                    *closure = Some(cause.clone());
                    (cause, true)
                }
            }
        };
        let calls = self.correlator.close(&recorded);
        let streams = self.subscriptions.close(&recorded);
        self.cache.close(&recorded);
        if first {
            info!(cause = %recorded, calls, streams, "connection failed");
            self.events.publish(ApiEvent::Closed(recorded));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// Clears what [`Inner::call`] registered for `id`.
///
/// Both steps are no-ops once the dispatcher has taken the reply.
struct CallRelease<'a> {
    inner: &'a Inner,
    id: ReqId,
}

impl Drop for CallRelease<'_> {
    fn drop(&mut self) {
        self.inner.correlator.cancel(self.id);
        self.inner.subscriptions.unbind_request(self.id);
    }
}

/// Discards a subscription still waiting for its first response when the
/// caller that created it goes away.
struct PendingSubscription<'a> {
    subscriptions: &'a SubscriptionManager,
    subscription: &'a Subscription,
}

impl Drop for PendingSubscription<'_> {
    fn drop(&mut self) {
        self.subscriptions.abandon_pending(self.subscription);
    }
}

/// Client for the Deriv WebSocket API.
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct DerivApi {
    inner: Arc<Inner>,
}

impl DerivApi {
    /// Connect to the endpoint described by `settings`.
    ///
    /// Fails with [`ApiError::Construction`] when the settings cannot produce
    /// a valid URL, or [`ApiError::Transport`] when the connection fails.
    pub async fn connect(settings: &DerivSettings) -> Result<Self> {
        let url = settings
            .api_url()
            .map_err(|e| ApiError::Construction(e.to_string()))?;
        let transport = WsTransport::connect(&url).await?;
        Ok(Self::with_transport(Arc::new(transport), EngineConfig::from(settings)))
    }

    /// Start the engine over an already-open transport.
    ///
    /// Must be called from within a Tokio runtime: the reader task is
    /// spawned immediately.
    pub fn with_transport(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let errors = Broadcast::new(config.error_buffer);
        let inner = Arc::new(Inner {
            transport: Arc::clone(&transport),
            correlator: Correlator::new(),
            subscriptions: SubscriptionManager::new(config.secondary_keys, config.stream_buffer),
            cache: ResponseCache::new(),
            tasks: TaskRegistry::new(errors.clone()),
            errors,
            events: Broadcast::new(config.event_buffer),
            closure: Mutex::new(None),
            reader_cancel: CancellationToken::new(),
            reader: Mutex::new(None),
        });
        let reader = tokio::spawn(dispatcher::run(
            Arc::downgrade(&inner),
            transport,
            inner.reader_cancel.clone(),
        ));
        *inner.reader.lock() = Some(reader);
        Self { inner }
    }

    /// Send one request and wait for its response.
    ///
    /// `request` must be a JSON object; a `req_id` field is added. A
    /// response carrying an `error` object fails with
    /// [`ApiError::Response`].
    pub async fn send(&self, request: Value) -> Result<Value> {
        self.inner.call(into_request(request)?, None).await
    }

    /// Subscribe to the stream `request` establishes.
    ///
    /// `subscribe: 1` is added. Equivalent requests share one stream and one
    /// server-side subscription: only the first one is transmitted, later
    /// ones wait for it to be established and return the same handle.
    ///
    /// If the caller that transmitted the request is dropped first, the
    /// ones waiting on it start over and one of them transmits again.
    pub async fn subscribe(&self, request: Value) -> Result<Subscription> {
        let mut request = into_request(request)?;
        let _ = request.insert(wire::SUBSCRIBE.to_string(), Value::from(1));

        loop {
            match self.inner.subscriptions.attach_or_create(&request)? {
                Attachment::Existing(subscription) => {
                    if self.inner.subscriptions.ready(&subscription).await? {
                        return Ok(subscription);
                    }
                    debug!(key = %subscription.key(), "establishing call dropped, attaching again");
                }
                Attachment::Created(subscription) => {
                    let _pending = PendingSubscription {
                        subscriptions: &self.inner.subscriptions,
                        subscription: &subscription,
                    };
                    return match self.inner.call(request.clone(), Some(&subscription)).await {
                        Ok(_) => Ok(subscription.clone()),
                        Err(e) => {
                            self.inner.subscriptions.abandon(&subscription, e.clone());
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Unsubscribe `id`.
    ///
    /// A local stream holding `id` completes for every consumer. The
    /// `forget` request is sent whether or not a local stream was found;
    /// the result says whether the server had the subscription.
    pub async fn forget(&self, id: impl Into<SubscriptionId>) -> Result<bool> {
        self.inner.forget(&id.into()).await
    }

    /// Unsubscribe every tracked stream whose request has `category`
    /// (e.g. `ticks`). Returns how many the server confirmed.
    ///
    /// Every `forget` runs to completion before the first failure, if any,
    /// is returned.
    pub async fn forget_all(&self, category: &str) -> Result<usize> {
        let ids = self.inner.subscriptions.ids_for_category(category);
        debug!(category, count = ids.len(), "forgetting subscriptions");
        let outcomes = join_all(ids.iter().map(|id| self.inner.forget(id))).await;
        let mut confirmed = 0;
        for outcome in outcomes {
            if outcome? {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    /// The cached message of `msg_type`, or the next one to arrive.
    ///
    /// The wait is registered when this is called, not when the future is
    /// first polled. The message is returned as received, error or not.
    pub fn expect_response(&self, msg_type: &str) -> ResponseFuture {
        self.inner.cache.expect(msg_type)
    }

    /// Serve `msg_type` from the cache, sending `request` only on a miss.
    pub async fn cached(&self, msg_type: &str, request: Value) -> Result<Value> {
        self.inner
            .cache
            .get_or_fetch(msg_type, || self.send(request))
            .await
    }

    /// The most recent message of `msg_type`, if any.
    pub fn latest(&self, msg_type: &str) -> Option<Value> {
        self.inner.cache.get(msg_type)
    }

    /// Stream of unroutable messages, transport failures and task failures.
    pub fn errors(&self) -> BoxStream<'static, ApiError> {
        self.inner.errors.subscribe()
    }

    /// Stream of lifecycle events.
    pub fn events(&self) -> BoxStream<'static, ApiEvent> {
        self.inner.events.subscribe()
    }

    /// Run `task` in the background, tracked for shutdown.
    ///
    /// A failure is published on [`errors`](Self::errors) as
    /// `deriv_api:<label>: <message>`.
    pub fn add_task<F, E>(&self, task: F, label: impl Into<String>)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display,
    {
        self.inner.tasks.spawn(label, task);
    }

    /// Wait for every background task to finish on its own.
    pub async fn drain(&self) {
        self.inner.tasks.drain().await;
    }

    /// Close the connection from this side.
    ///
    /// Every later call fails with `Closed by disconnect`. The transport's
    /// own closure is reported on [`errors`](Self::errors).
    pub async fn disconnect(&self) {
        info!("disconnecting");
        self.inner
            .fail(ClosureCause::local(ClosureCause::NORMAL, DISCONNECT_REASON));
        self.inner.transport.close().await;
    }

    /// Shut the engine down.
    ///
    /// Stops the reader, fails everything pending, cancels and awaits
    /// background tasks, empties the cache and closes the transport.
    pub async fn clear(&self) {
        self.inner.reader_cancel.cancel();
        self.inner
            .fail(ClosureCause::local(ClosureCause::NORMAL, CLEAR_REASON));
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.inner.tasks.shutdown().await;
        self.inner.cache.clear();
        self.inner.transport.close().await;
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.inner.closure.lock().is_none()
    }

    /// Why the connection closed, once it has.
    pub fn closure(&self) -> Option<ClosureCause> {
        self.inner.closure.lock().clone()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending()
    }

    /// Existing subscription for `request`, without transmitting anything.
    pub fn subscription(&self, request: &Value) -> Option<Subscription> {
        request
            .as_object()
            .and_then(|request| self.inner.subscriptions.find(request))
    }

    /// Number of tracked subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of derived reuse keys currently mapped.
    pub fn secondary_key_count(&self) -> usize {
        self.inner.subscriptions.secondary_len()
    }
}

impl std::fmt::Debug for DerivApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivApi")
            .field("connected", &self.is_connected())
            .field("pending_calls", &self.pending_calls())
            .field("subscriptions", &self.inner.subscriptions)
            .finish_non_exhaustive()
    }
}

fn into_request(request: Value) -> Result<Request> {
    match request {
        Value::Object(request) => Ok(request),
        other => Err(ApiError::Api(format!("request must be a JSON object, got {other}"))),
    }
}
