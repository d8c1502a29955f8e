//! ridge-session — sessions, entities, and dispatch over the transports.
//!
//! A [`Session`] owns its transports, the entity registries, and the
//! mapping tables. Entities (subscribers, queryables, publishers, tokens,
//! interests) are declared against key expressions and undeclared on drop.

pub mod config;
pub mod scout;

mod dispatch;
mod error;
mod query;
mod state;

pub use config::{Config, ConfigError, Mode};
pub use error::SessionError;
pub use query::{Query, Reply};
pub use ridge_proto::msg::{Declaration, Hello, InterestOptions};
pub use ridge_proto::{
    CongestionControl, Encoding, KeyExpr, PeerId, QoS, Sample, SampleKind, WhatAmI,
};
pub use scout::scout;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use ridge_link::{Endpoint, Link, Scheme};
use ridge_proto::core::close_reason;
use ridge_proto::msg::network::{
    InterestMsg, NetworkMessage, Push, PushBody, Put, Del, Request, RequestBody,
    Query as WireQuery, QueryBody, SessionDeclare, WireKeyExpr,
};
use ridge_proto::msg::{Declaration as Decl, QueryableInfo, Reliability};
use ridge_proto::Timestamp;
use ridge_transport::{TransportConfig, TransportMulticast, TransportUnicast};

use dispatch::SessionHandler;
use state::{
    Callback, InterestEntity, PendingQuery, QueryableEntity, SessionState, SubscriberKind,
    SubscriptionEntity,
};

// ── Options ───────────────────────────────────────────────────────────────────

/// Options for `put`/`delete`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub encoding: Encoding,
    pub attachment: Option<Bytes>,
    pub timestamp: Option<Timestamp>,
    pub congestion: CongestionControl,
    pub priority: Option<u8>,
    pub express: bool,
}

impl PutOptions {
    fn qos(&self) -> QoS {
        QoS {
            priority: self.priority.unwrap_or(QoS::DEFAULT_PRIORITY),
            congestion: self.congestion,
            express: self.express,
        }
    }
}

/// Options for `get`.
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub payload: Option<Bytes>,
    pub encoding: Encoding,
    pub attachment: Option<Bytes>,
    pub timeout_ms: u64,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            payload: None,
            encoding: Encoding::empty(),
            attachment: None,
            timeout_ms: 10_000,
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A Ridge session. Create with [`Session::open`], always used as
/// `Arc<Session>`.
pub struct Session {
    zid: PeerId,
    whatami: WhatAmI,
    config: Config,
    state: Mutex<SessionState>,
    unicast: DashMap<PeerId, TransportUnicast>,
    multicast: Mutex<Option<TransportMulticast>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    listen_addrs: Mutex<Vec<std::net::SocketAddr>>,
    closed: AtomicBool,
    /// Set once any transport existed; distinguishes "lost the last link"
    /// from "never had one".
    had_transport: AtomicBool,
    runtime: tokio::runtime::Handle,
    weak_self: Weak<Session>,
}

impl Session {
    /// Open a session: dial every `connect` endpoint, bind every `listen`
    /// endpoint, and start the machinery.
    pub async fn open(config: Config) -> Result<Arc<Session>, SessionError> {
        let zid = PeerId::random();
        let whatami = match config.mode {
            Mode::Client => WhatAmI::Client,
            Mode::Peer => WhatAmI::Peer,
        };
        tracing::info!(%zid, ?whatami, "opening session");

        let session = Arc::new_cyclic(|weak| Session {
            zid,
            whatami,
            config: config.clone(),
            state: Mutex::new(SessionState::default()),
            unicast: DashMap::new(),
            multicast: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            listen_addrs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            had_transport: AtomicBool::new(false),
            runtime: tokio::runtime::Handle::current(),
            weak_self: weak.clone(),
        });

        for ep in &config.connect {
            session.connect_endpoint(ep).await?;
        }
        for ep in &config.listen {
            session.listen_endpoint(ep).await?;
        }
        Ok(session)
    }

    pub fn zid(&self) -> PeerId {
        self.zid
    }

    pub fn whatami(&self) -> WhatAmI {
        self.whatami
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Addresses the session actually accepts on (resolves port 0 binds).
    pub fn listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listen_addrs.lock().unwrap().clone()
    }

    /// Remote ids of the currently connected unicast peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.unicast.iter().map(|t| *t.key()).collect()
    }

    /// Close the session: cancel pending queries, drop every entity, close
    /// every transport, stop the accept loops.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(zid = %self.zid, "closing session");

        for handle in self.listeners.lock().unwrap().drain(..) {
            handle.abort();
        }

        // Pending queries get their terminal drop notification.
        let pending: Vec<PendingQuery> = {
            let mut state = self.state();
            state.pending_queries.drain().map(|(_, pq)| pq).collect()
        };
        for pq in pending {
            pq.finish();
        }

        // Entities die with the session; their drop handlers run now.
        let (subs, queryables, interests) = {
            let mut state = self.state();
            (
                state.subscriptions.drain().collect::<Vec<_>>(),
                state.queryables.drain().collect::<Vec<_>>(),
                state.interests.drain().collect::<Vec<_>>(),
            )
        };
        for (_, s) in subs {
            s.callback.notify_drop();
        }
        for (_, q) in queryables {
            q.callback.notify_drop();
        }
        for (_, i) in interests {
            i.callback.notify_drop();
        }

        let transports: Vec<TransportUnicast> =
            self.unicast.iter().map(|t| t.value().clone()).collect();
        self.unicast.clear();
        for t in transports {
            t.close(close_reason::GENERIC).await;
        }
        let multicast = self.multicast.lock().unwrap().take();
        if let Some(m) = multicast {
            m.close(close_reason::GENERIC).await;
        }
        Ok(())
    }

    // ── Connectivity ──────────────────────────────────────────────────────────

    async fn connect_endpoint(self: &Arc<Self>, ep: &str) -> Result<(), SessionError> {
        let mut endpoint = Endpoint::parse(ep)?;
        if let Some(user) = &self.config.user {
            endpoint.config_set("user", user);
        }
        if let Some(password) = &self.config.password {
            endpoint.config_set("password", password);
        }

        let link = Link::open(&endpoint).await?;
        if link.capabilities().multicast {
            let transport =
                TransportMulticast::open(link, self.transport_config(), self.handler()).await?;
            *self.multicast.lock().unwrap() = Some(transport);
            self.had_transport.store(true, Ordering::SeqCst);
        } else {
            let transport =
                TransportUnicast::open(link, self.transport_config(), self.handler()).await?;
            let (zid, whatami) = (transport.remote_zid(), transport.remote_whatami());
            self.unicast.insert(zid, transport);
            self.on_peer_connected(&zid, whatami);
        }
        tracing::info!(endpoint = %endpoint, "connected");
        Ok(())
    }

    async fn listen_endpoint(self: &Arc<Self>, ep: &str) -> Result<(), SessionError> {
        let endpoint = Endpoint::parse(ep)?;
        if endpoint.scheme == Scheme::Udp {
            // A multicast "listen" is the same group transport as a connect;
            // unicast UDP cannot accept.
            if endpoint.socket_addr()?.ip().is_multicast() {
                return self.connect_endpoint(ep).await;
            }
            return Err(ridge_link::LinkError::Unsupported("udp listen").into());
        }
        let listener = ridge_link::listen(&endpoint).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening");
        self.listen_addrs.lock().unwrap().push(local);

        let session = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            loop {
                // Upgrade only after an accept: holding the session strongly
                // across the blocking accept would keep it alive forever.
                let link = match listener.accept().await {
                    Ok(l) => Link::Tcp(l),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let Some(strong) = session.upgrade() else { return };
                match TransportUnicast::accept(link, strong.transport_config(), strong.handler())
                    .await
                {
                    Ok(transport) => {
                        let (zid, whatami) = (transport.remote_zid(), transport.remote_whatami());
                        strong.unicast.insert(zid, transport);
                        strong.on_peer_connected(&zid, whatami);
                    }
                    Err(e) => tracing::warn!(error = %e, "inbound handshake failed"),
                }
            }
        });
        self.listeners.lock().unwrap().push(handle);
        Ok(())
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            zid: self.zid,
            whatami: self.whatami,
            sn_resolution: self.config.sn_resolution,
            batch_size: self.config.batch_size,
            lease_ms: self.config.lease_ms,
            defrag_budget: self.config.defrag_budget,
        }
    }

    fn handler(self: &Arc<Self>) -> Arc<SessionHandler> {
        Arc::new(SessionHandler {
            session: self.weak_self.clone(),
        })
    }

    // ── Publication ───────────────────────────────────────────────────────────

    /// Publish a value on `key`.
    pub async fn put(
        self: &Arc<Self>,
        key: &str,
        payload: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let payload = payload.into();
        let msg = NetworkMessage::Push(Push {
            key: WireKeyExpr::from_str(key.as_str()),
            qos: opts.qos(),
            body: PushBody::Put(Put {
                timestamp: opts.timestamp,
                encoding: opts.encoding.clone(),
                payload: payload.clone(),
                attachment: opts.attachment.clone(),
            }),
        });
        self.send_to_all(&msg, Reliability::Reliable, opts.congestion)
            .await?;
        let qos = opts.qos();
        self.deliver_local(Sample {
            key,
            payload,
            encoding: opts.encoding,
            kind: SampleKind::Put,
            timestamp: opts.timestamp,
            attachment: opts.attachment,
            qos,
        });
        Ok(())
    }

    /// Retract the value of `key`.
    pub async fn delete(
        self: &Arc<Self>,
        key: &str,
        opts: PutOptions,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let msg = NetworkMessage::Push(Push {
            key: WireKeyExpr::from_str(key.as_str()),
            qos: opts.qos(),
            body: PushBody::Del(Del {
                timestamp: opts.timestamp,
            }),
        });
        self.send_to_all(&msg, Reliability::Reliable, opts.congestion)
            .await?;
        self.deliver_local(Sample {
            key,
            payload: Bytes::new(),
            encoding: Encoding::empty(),
            kind: SampleKind::Delete,
            timestamp: opts.timestamp,
            attachment: None,
            qos: opts.qos(),
        });
        Ok(())
    }

    /// Publish through a declared key-expression id: the wire carries
    /// `(id, suffix)` instead of the full key.
    pub async fn put_scoped(
        self: &Arc<Self>,
        ke: &DeclaredKeyExpr,
        suffix: &str,
        payload: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let full = KeyExpr::new(format!("{}{}", ke.prefix, suffix))
            .map_err(|_| SessionError::KeyExprNotCanonical)?;
        let payload = payload.into();
        let msg = NetworkMessage::Push(Push {
            key: WireKeyExpr::scoped(ke.id, suffix),
            qos: opts.qos(),
            body: PushBody::Put(Put {
                timestamp: opts.timestamp,
                encoding: opts.encoding.clone(),
                payload: payload.clone(),
                attachment: opts.attachment.clone(),
            }),
        });
        self.send_to_all(&msg, Reliability::Reliable, opts.congestion)
            .await?;
        let qos = opts.qos();
        self.deliver_local(Sample {
            key: full,
            payload,
            encoding: opts.encoding,
            kind: SampleKind::Put,
            timestamp: opts.timestamp,
            attachment: opts.attachment,
            qos,
        });
        Ok(())
    }

    fn deliver_local(&self, sample: Sample) {
        let subs = self
            .state()
            .matching_subscriptions(SubscriberKind::Regular, &sample.key);
        for sub in subs {
            sub.callback.invoke(sample.clone());
        }
    }

    // ── Declarations ──────────────────────────────────────────────────────────

    /// Bind a numeric id to `prefix` for wire compression. The prefix is a
    /// raw string; only `prefix + suffix` concatenations must canonize.
    pub async fn declare_keyexpr(
        self: &Arc<Self>,
        prefix: &str,
    ) -> Result<DeclaredKeyExpr, SessionError> {
        self.ensure_open()?;
        if prefix.is_empty() {
            return Err(SessionError::KeyExprNotCanonical);
        }
        let id = {
            let mut state = self.state();
            let id = state.next_keyexpr_id();
            state.local_mappings.insert(id, prefix.to_string());
            id
        };
        let msg = NetworkMessage::Declare(SessionDeclare {
            interest_id: None,
            declaration: Decl::KeyExpr {
                id,
                suffix: prefix.to_string(),
            },
        });
        self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
            .await?;
        Ok(DeclaredKeyExpr {
            session: self.weak_self.clone(),
            id,
            prefix: prefix.to_string(),
            undeclared: false,
        })
    }

    /// Subscribe to samples published on keys intersecting `key`.
    pub async fn declare_subscriber(
        self: &Arc<Self>,
        key: &str,
        callback: impl Fn(Sample) + Send + Sync + 'static,
    ) -> Result<Subscriber, SessionError> {
        self.subscriber_inner(key, SubscriberKind::Regular, Callback::new(callback))
            .await
    }

    /// Like [`Session::declare_subscriber`], with a drop notification that
    /// fires on undeclare or session close.
    pub async fn declare_subscriber_with_drop(
        self: &Arc<Self>,
        key: &str,
        callback: impl Fn(Sample) + Send + Sync + 'static,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Result<Subscriber, SessionError> {
        self.subscriber_inner(
            key,
            SubscriberKind::Regular,
            Callback::with_drop(callback, on_drop),
        )
        .await
    }

    async fn subscriber_inner(
        self: &Arc<Self>,
        key: &str,
        kind: SubscriberKind,
        callback: Callback<Sample>,
    ) -> Result<Subscriber, SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let id = {
            let mut state = self.state();
            let id = state.next_entity_id();
            state.subscriptions.insert(
                id,
                Arc::new(SubscriptionEntity {
                    id,
                    key: key.clone(),
                    kind,
                    callback,
                }),
            );
            id
        };
        match kind {
            SubscriberKind::Regular => {
                let msg = NetworkMessage::Declare(SessionDeclare {
                    interest_id: None,
                    declaration: Decl::Subscriber {
                        id,
                        key: WireKeyExpr::from_str(key.as_str()),
                    },
                });
                self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                    .await?;
            }
            SubscriberKind::Liveliness => {
                // Ask every peer for current tokens and all future ones.
                let msg = NetworkMessage::Interest(InterestMsg {
                    id,
                    options: InterestOptions(
                        InterestOptions::TOKENS
                            | InterestOptions::CURRENT
                            | InterestOptions::FUTURE
                            | InterestOptions::RESTRICTED,
                    ),
                    key: Some(WireKeyExpr::from_str(key.as_str())),
                });
                self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                    .await?;
            }
        }
        tracing::debug!(id, key = %key, ?kind, "subscriber declared");
        Ok(Subscriber {
            session: self.weak_self.clone(),
            id,
            undeclared: false,
        })
    }

    /// Subscribe to liveliness: a PUT sample when a matching token appears,
    /// a DELETE when it is undeclared or its peer goes away.
    pub async fn declare_liveliness_subscriber(
        self: &Arc<Self>,
        key: &str,
        callback: impl Fn(Sample) + Send + Sync + 'static,
    ) -> Result<Subscriber, SessionError> {
        self.subscriber_inner(key, SubscriberKind::Liveliness, Callback::new(callback))
            .await
    }

    /// Declare a handler answering queries on keys intersecting `key`.
    pub async fn declare_queryable(
        self: &Arc<Self>,
        key: &str,
        complete: bool,
        callback: impl Fn(Query) + Send + Sync + 'static,
    ) -> Result<Queryable, SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let id = {
            let mut state = self.state();
            let id = state.next_entity_id();
            state.queryables.insert(
                id,
                Arc::new(QueryableEntity {
                    id,
                    key: key.clone(),
                    complete,
                    callback: Callback::new(callback),
                }),
            );
            id
        };
        let msg = NetworkMessage::Declare(SessionDeclare {
            interest_id: None,
            declaration: Decl::Queryable {
                id,
                key: WireKeyExpr::from_str(key.as_str()),
                info: QueryableInfo {
                    complete,
                    distance: 0,
                },
            },
        });
        self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
            .await?;
        tracing::debug!(id, key = %key, "queryable declared");
        Ok(Queryable {
            session: self.weak_self.clone(),
            id,
            undeclared: false,
        })
    }

    /// Declare a publisher: the full key is mapped to a numeric id once,
    /// and every `put` ships the compressed form.
    pub async fn declare_publisher(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<Publisher, SessionError> {
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let ke = self.declare_keyexpr(key.as_str()).await?;
        Ok(Publisher { ke, key })
    }

    /// Announce a liveliness token on `key`; peers with matching liveliness
    /// subscribers observe it until undeclare or session close.
    pub async fn liveliness_token(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<LivelinessToken, SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let id = {
            let mut state = self.state();
            let id = state.next_entity_id();
            state.tokens.insert(id, key.clone());
            id
        };
        let msg = NetworkMessage::Declare(SessionDeclare {
            interest_id: None,
            declaration: Decl::Token {
                id,
                key: WireKeyExpr::from_str(key.as_str()),
            },
        });
        self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
            .await?;
        tracing::debug!(id, key = %key, "liveliness token declared");
        Ok(LivelinessToken {
            session: self.weak_self.clone(),
            id,
            undeclared: false,
        })
    }

    /// Register an interest in declarations matching `key`; the callback
    /// receives each matching declaration, ending the current replay with
    /// [`Declaration::Final`].
    pub async fn declare_interest(
        self: &Arc<Self>,
        key: Option<&str>,
        options: u8,
        callback: impl Fn(Declaration) + Send + Sync + 'static,
    ) -> Result<Interest, SessionError> {
        self.ensure_open()?;
        let key = match key {
            Some(k) => Some(KeyExpr::new(k).map_err(|_| SessionError::KeyExprNotCanonical)?),
            None => None,
        };
        let id = {
            let mut state = self.state();
            let id = state.next_entity_id();
            state.interests.insert(
                id,
                Arc::new(InterestEntity {
                    id,
                    key: key.clone(),
                    options,
                    callback: Callback::new(callback),
                }),
            );
            id
        };
        let mut wire_options = options;
        if key.is_some() {
            wire_options |= InterestOptions::RESTRICTED;
        }
        let msg = NetworkMessage::Interest(InterestMsg {
            id,
            options: InterestOptions(wire_options),
            key: key.as_ref().map(|k| WireKeyExpr::from_str(k.as_str())),
        });
        self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
            .await?;
        Ok(Interest {
            session: self.weak_self.clone(),
            id,
            undeclared: false,
        })
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Issue a query. `selector` is `key` or `key?parameters`. The callback
    /// sees every reply; `on_drop` fires exactly once when the query ends —
    /// final received, deadline hit, or session closed.
    pub async fn get(
        self: &Arc<Self>,
        selector: &str,
        opts: GetOptions,
        callback: impl Fn(Reply) + Send + Sync + 'static,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let (key_str, parameters) = match selector.split_once('?') {
            Some((k, p)) => (k, p.to_string()),
            None => (selector, String::new()),
        };
        let key = KeyExpr::new(key_str).map_err(|_| SessionError::KeyExprNotCanonical)?;

        let request_id = {
            let mut state = self.state();
            let request_id = state.next_request_id();
            state.pending_queries.insert(
                request_id,
                PendingQuery {
                    id: request_id,
                    key: key.clone(),
                    callback: Arc::new(Callback::with_drop(callback, on_drop)),
                    deadline: None,
                },
            );
            request_id
        };

        // Deadline watchdog: a query that saw no final by its timeout is
        // terminated locally with the drop notification.
        let weak = self.weak_self.clone();
        let timeout = Duration::from_millis(opts.timeout_ms.max(1));
        let watchdog = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                let pending = session.state().pending_queries.remove(&request_id);
                if let Some(pq) = pending {
                    tracing::debug!(id = request_id, "query timed out");
                    pq.callback.notify_drop();
                }
            }
        });
        if let Some(pq) = self.state().pending_queries.get_mut(&request_id) {
            pq.deadline = Some(watchdog);
        } else {
            // Already finished (e.g. instant local timeout); nothing to arm.
            watchdog.abort();
        }

        let msg = NetworkMessage::Request(Request {
            id: request_id,
            key: WireKeyExpr::from_str(key.as_str()),
            qos: QoS::default(),
            body: RequestBody::Query(WireQuery {
                parameters,
                body: opts.payload.map(|payload| QueryBody {
                    encoding: opts.encoding,
                    payload,
                }),
                attachment: opts.attachment,
            }),
        });
        self.send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
            .await?;
        Ok(())
    }

    /// Declare a querier: a reusable `get` bound to one key.
    pub async fn declare_querier(
        self: &Arc<Self>,
        key: &str,
        timeout_ms: u64,
    ) -> Result<Querier, SessionError> {
        self.ensure_open()?;
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        Ok(Querier {
            session: self.weak_self.clone(),
            key,
            timeout_ms,
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Send one message over every transport.
    pub(crate) async fn send_to_all(
        &self,
        msg: &NetworkMessage,
        reliability: Reliability,
        congestion: CongestionControl,
    ) -> Result<(), SessionError> {
        let transports: Vec<TransportUnicast> =
            self.unicast.iter().map(|t| t.value().clone()).collect();
        for t in transports {
            if let Err(e) = t.send(msg, reliability, congestion).await {
                tracing::warn!(remote = %t.remote_zid(), error = %e, "send failed");
            }
        }
        let multicast = self.multicast.lock().unwrap().clone();
        if let Some(m) = multicast {
            if let Err(e) = m.send(msg, reliability, congestion).await {
                tracing::warn!(error = %e, "multicast send failed");
            }
        }
        Ok(())
    }

    /// Send one message towards a specific peer: its unicast transport if
    /// we have one, the group otherwise.
    pub(crate) async fn send_to_peer(
        &self,
        peer: &PeerId,
        msg: &NetworkMessage,
        reliability: Reliability,
        congestion: CongestionControl,
    ) -> Result<(), SessionError> {
        let unicast = self.unicast.get(peer).map(|t| t.value().clone());
        if let Some(t) = unicast {
            t.send(msg, reliability, congestion).await?;
            return Ok(());
        }
        let multicast = self.multicast.lock().unwrap().clone();
        if let Some(m) = multicast {
            m.send(msg, reliability, congestion).await?;
            return Ok(());
        }
        Err(SessionError::EntityUnknown)
    }

    /// Replay our declarations to a peer that just appeared.
    pub(crate) fn on_peer_connected(self: &Arc<Self>, peer: &PeerId, whatami: WhatAmI) {
        tracing::debug!(%peer, ?whatami, "peer connected");
        self.had_transport.store(true, Ordering::SeqCst);

        let mut replay: Vec<Decl> = Vec::new();
        {
            let state = self.state();
            for (id, prefix) in state.local_mappings.iter() {
                replay.push(Decl::KeyExpr {
                    id: *id,
                    suffix: prefix.clone(),
                });
            }
            for sub in state.subscriptions.values() {
                if sub.kind == SubscriberKind::Regular {
                    replay.push(Decl::Subscriber {
                        id: sub.id,
                        key: WireKeyExpr::from_str(sub.key.as_str()),
                    });
                }
            }
            for q in state.queryables.values() {
                replay.push(Decl::Queryable {
                    id: q.id,
                    key: WireKeyExpr::from_str(q.key.as_str()),
                    info: QueryableInfo {
                        complete: q.complete,
                        distance: 0,
                    },
                });
            }
            for (id, key) in state.tokens.iter() {
                replay.push(Decl::Token {
                    id: *id,
                    key: WireKeyExpr::from_str(key.as_str()),
                });
            }
        }
        if replay.is_empty() {
            return;
        }
        let session = self.clone();
        let peer = *peer;
        self.runtime.spawn(async move {
            for declaration in replay {
                let msg = NetworkMessage::Declare(SessionDeclare {
                    interest_id: None,
                    declaration,
                });
                if let Err(e) = session
                    .send_to_peer(&peer, &msg, Reliability::Reliable, CongestionControl::Block)
                    .await
                {
                    tracing::debug!(error = %e, "declaration replay failed");
                    return;
                }
            }
        });
    }

    /// Drop everything attributed to a peer; close the session if that was
    /// the last way out.
    pub(crate) fn on_peer_disconnected(
        self: &Arc<Self>,
        peer: &PeerId,
        reason: ridge_transport::DisconnectReason,
    ) {
        tracing::info!(%peer, ?reason, "peer disconnected");
        self.unicast.remove(peer);

        // Remote mappings and tokens of that peer are gone; matching
        // liveliness subscribers observe the disappearance.
        let fired = {
            let mut state = self.state();
            state.remote_mappings.retain(|(p, _), _| p != peer);
            let gone: Vec<KeyExpr> = {
                let keys: Vec<(PeerId, u32)> = state
                    .remote_tokens
                    .keys()
                    .filter(|(p, _)| p == peer)
                    .copied()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| state.remote_tokens.remove(&k))
                    .collect()
            };
            gone.into_iter()
                .map(|key| {
                    let subs = state.matching_subscriptions(SubscriberKind::Liveliness, &key);
                    (key, subs)
                })
                .collect::<Vec<_>>()
        };
        for (key, subs) in fired {
            let sample = Sample {
                key,
                payload: Bytes::new(),
                encoding: Encoding::empty(),
                kind: SampleKind::Delete,
                timestamp: None,
                attachment: None,
                qos: QoS::default(),
            };
            for sub in subs {
                sub.callback.invoke(sample.clone());
            }
        }

        // A session bound to a single closed link transitions to Closed.
        // Sessions that listen or sit on a group can regain peers instead.
        let no_links = self.unicast.is_empty()
            && self.multicast.lock().unwrap().is_none()
            && self.listeners.lock().unwrap().is_empty();
        if no_links && self.had_transport.load(Ordering::SeqCst) {
            self.close_on_loss();
        }
    }

    /// Loss-of-connectivity close: mark closed and cancel pending queries.
    /// Runs on transport tasks, so it must not block.
    fn close_on_loss(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(zid = %self.zid, "session lost its last link, closing");
        let pending: Vec<PendingQuery> = {
            let mut state = self.state();
            state.pending_queries.drain().map(|(_, pq)| pq).collect()
        };
        for pq in pending {
            pq.finish();
        }
    }

    // ── Undeclare paths (called by entity handles) ────────────────────────────

    pub(crate) async fn undeclare_subscriber(&self, id: u32) -> Result<(), SessionError> {
        let (entity, kind) = {
            let mut state = self.state();
            match state.subscriptions.remove(&id) {
                Some(e) => {
                    let kind = e.kind;
                    (e, kind)
                }
                None => return Err(SessionError::EntityUnknown),
            }
        };
        entity.callback.notify_drop();
        if kind == SubscriberKind::Regular && !self.is_closed() {
            let msg = NetworkMessage::Declare(SessionDeclare {
                interest_id: None,
                declaration: Decl::UndeclSubscriber { id, key: None },
            });
            let _ = self
                .send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                .await;
        }
        Ok(())
    }

    pub(crate) async fn undeclare_queryable(&self, id: u32) -> Result<(), SessionError> {
        let entity = self
            .state()
            .queryables
            .remove(&id)
            .ok_or(SessionError::EntityUnknown)?;
        entity.callback.notify_drop();
        if !self.is_closed() {
            let msg = NetworkMessage::Declare(SessionDeclare {
                interest_id: None,
                declaration: Decl::UndeclQueryable { id, key: None },
            });
            let _ = self
                .send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                .await;
        }
        Ok(())
    }

    pub(crate) async fn undeclare_token(&self, id: u32) -> Result<(), SessionError> {
        self.state()
            .tokens
            .remove(&id)
            .ok_or(SessionError::EntityUnknown)?;
        if !self.is_closed() {
            let msg = NetworkMessage::Declare(SessionDeclare {
                interest_id: None,
                declaration: Decl::UndeclToken { id, key: None },
            });
            let _ = self
                .send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                .await;
        }
        Ok(())
    }

    pub(crate) async fn undeclare_interest(&self, id: u32) -> Result<(), SessionError> {
        let entity = self
            .state()
            .interests
            .remove(&id)
            .ok_or(SessionError::EntityUnknown)?;
        entity.callback.notify_drop();
        Ok(())
    }

    pub(crate) async fn undeclare_keyexpr(&self, id: u16) -> Result<(), SessionError> {
        self.state()
            .local_mappings
            .remove(&id)
            .ok_or(SessionError::EntityUnknown)?;
        if !self.is_closed() {
            let msg = NetworkMessage::Declare(SessionDeclare {
                interest_id: None,
                declaration: Decl::UndeclKeyExpr { id },
            });
            let _ = self
                .send_to_all(&msg, Reliability::Reliable, CongestionControl::Block)
                .await;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.listeners.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

// ── Entity handles ────────────────────────────────────────────────────────────

/// A declared key-expression mapping. Undeclared on drop.
pub struct DeclaredKeyExpr {
    session: Weak<Session>,
    id: u16,
    prefix: String,
    undeclared: bool,
}

impl DeclaredKeyExpr {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn undeclare(mut self) -> Result<(), SessionError> {
        self.undeclared = true;
        let session = self.session.upgrade().ok_or(SessionError::Closed)?;
        session.undeclare_keyexpr(self.id).await
    }
}

impl Drop for DeclaredKeyExpr {
    fn drop(&mut self) {
        if self.undeclared {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            let id = self.id;
            session.runtime().clone().spawn(async move {
                let _ = session.undeclare_keyexpr(id).await;
            });
        }
    }
}

macro_rules! entity_handle {
    ($(#[$doc:meta])* $name:ident, $undeclare:ident) => {
        $(#[$doc])*
        pub struct $name {
            session: Weak<Session>,
            id: u32,
            undeclared: bool,
        }

        impl $name {
            /// The session-local entity id.
            pub fn id(&self) -> u32 {
                self.id
            }

            /// Explicit undeclare; the entity's drop handler fires now.
            pub async fn undeclare(mut self) -> Result<(), SessionError> {
                self.undeclared = true;
                let session = self.session.upgrade().ok_or(SessionError::Closed)?;
                session.$undeclare(self.id).await
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if self.undeclared {
                    return;
                }
                if let Some(session) = self.session.upgrade() {
                    let id = self.id;
                    session.runtime().clone().spawn(async move {
                        let _ = session.$undeclare(id).await;
                    });
                }
            }
        }
    };
}

entity_handle!(
    /// A declared subscriber. Undeclared on drop.
    Subscriber,
    undeclare_subscriber
);
entity_handle!(
    /// A declared queryable. Undeclared on drop.
    Queryable,
    undeclare_queryable
);
entity_handle!(
    /// A declared liveliness token. Its disappearance is observable by
    /// matching liveliness subscribers.
    LivelinessToken,
    undeclare_token
);
entity_handle!(
    /// A registered interest in declarations.
    Interest,
    undeclare_interest
);

/// A publisher bound to one key, shipping the compressed wire form.
pub struct Publisher {
    ke: DeclaredKeyExpr,
    key: KeyExpr,
}

impl Publisher {
    pub fn key(&self) -> &KeyExpr {
        &self.key
    }

    pub async fn put(
        &self,
        payload: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<(), SessionError> {
        let session = self.ke.session.upgrade().ok_or(SessionError::Closed)?;
        session.put_scoped(&self.ke, "", payload, opts).await
    }

    pub async fn delete(&self, opts: PutOptions) -> Result<(), SessionError> {
        let session = self.ke.session.upgrade().ok_or(SessionError::Closed)?;
        session.delete(self.key.as_str(), opts).await
    }

    pub async fn undeclare(self) -> Result<(), SessionError> {
        self.ke.undeclare().await
    }
}

/// A reusable querier bound to one key.
pub struct Querier {
    session: Weak<Session>,
    key: KeyExpr,
    timeout_ms: u64,
}

impl Querier {
    pub fn key(&self) -> &KeyExpr {
        &self.key
    }

    pub async fn get(
        &self,
        parameters: &str,
        opts: GetOptions,
        callback: impl Fn(Reply) + Send + Sync + 'static,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Result<(), SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::Closed)?;
        let selector = if parameters.is_empty() {
            self.key.as_str().to_string()
        } else {
            format!("{}?{}", self.key.as_str(), parameters)
        };
        let opts = GetOptions {
            timeout_ms: self.timeout_ms,
            ..opts
        };
        session.get(&selector, opts, callback, on_drop).await
    }
}
