//! The session's entity registries and mapping tables.
//!
//! Everything here lives under the session's inner lock. Matching walks
//! snapshot the entities they selected and invoke callbacks only after the
//! lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ridge_proto::msg::network::{Mapping, WireKeyExpr};
use ridge_proto::{KeyExpr, PeerId, Sample};

use crate::error::SessionError;
use crate::query::Reply;

/// A user callback plus its one-shot drop notification.
///
/// The drop handler fires exactly once: on undeclare, on a query's final
/// notification, or at session close.
pub struct Callback<T> {
    call: Box<dyn Fn(T) + Send + Sync>,
    on_drop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T> Callback<T> {
    pub fn new(call: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            call: Box::new(call),
            on_drop: Mutex::new(None),
        }
    }

    pub fn with_drop(
        call: impl Fn(T) + Send + Sync + 'static,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            call: Box::new(call),
            on_drop: Mutex::new(Some(Box::new(on_drop))),
        }
    }

    pub fn invoke(&self, value: T) {
        (self.call)(value);
    }

    /// Fire the drop notification, once.
    pub fn notify_drop(&self) {
        if let Some(f) = self.on_drop.lock().unwrap().take() {
            f();
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    /// Data samples published on matching keys.
    Regular,
    /// Token declarations: PUT when a token appears, DELETE when it goes.
    Liveliness,
}

pub struct SubscriptionEntity {
    pub id: u32,
    pub key: KeyExpr,
    pub kind: SubscriberKind,
    pub callback: Callback<Sample>,
}

pub struct QueryableEntity {
    pub id: u32,
    pub key: KeyExpr,
    pub complete: bool,
    pub callback: Callback<crate::query::Query>,
}

pub struct InterestEntity {
    pub id: u32,
    pub key: Option<KeyExpr>,
    pub options: u8,
    pub callback: Callback<ridge_proto::msg::Declaration>,
}

pub struct PendingQuery {
    pub id: u32,
    pub key: KeyExpr,
    pub callback: Arc<Callback<Reply>>,
    /// Aborts the deadline watchdog when the query completes early.
    pub deadline: Option<tokio::task::JoinHandle<()>>,
}

impl PendingQuery {
    /// Final notification: stop the watchdog, tell the caller it is over.
    pub fn finish(self) {
        if let Some(handle) = self.deadline {
            handle.abort();
        }
        self.callback.notify_drop();
    }
}

/// Everything guarded by the session's inner lock.
#[derive(Default)]
pub struct SessionState {
    next_keyexpr_id: u16,
    next_entity_id: u32,
    next_request_id: u32,

    /// Ids we minted and declared, id → prefix string.
    pub local_mappings: HashMap<u16, String>,
    /// Ids peers declared to us, (peer, id) → prefix string.
    pub remote_mappings: HashMap<(PeerId, u16), String>,

    pub subscriptions: HashMap<u32, Arc<SubscriptionEntity>>,
    pub queryables: HashMap<u32, Arc<QueryableEntity>>,
    pub interests: HashMap<u32, Arc<InterestEntity>>,
    pub pending_queries: HashMap<u32, PendingQuery>,
    /// Liveliness tokens we declared, id → key.
    pub tokens: HashMap<u32, KeyExpr>,
    /// Liveliness tokens peers declared, (peer, id) → key.
    pub remote_tokens: HashMap<(PeerId, u32), KeyExpr>,
}

impl SessionState {
    /// Local ids are monotone per kind and never reused.
    pub fn next_entity_id(&mut self) -> u32 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }

    pub fn next_keyexpr_id(&mut self) -> u16 {
        self.next_keyexpr_id += 1;
        self.next_keyexpr_id
    }

    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Resolve a wire key expression to its full key.
    ///
    /// `peer` scopes sender-minted ids; receiver-minted ids are ours.
    pub fn expand(&self, peer: &PeerId, ke: &WireKeyExpr) -> Result<KeyExpr, SessionError> {
        let full = if ke.scope == 0 {
            ke.suffix.clone()
        } else {
            let prefix = match ke.mapping {
                Mapping::Sender => self.remote_mappings.get(&(*peer, ke.scope)),
                Mapping::Receiver => self.local_mappings.get(&ke.scope),
            }
            .ok_or(SessionError::KeyExprUnknown(ke.scope))?;
            format!("{prefix}{}", ke.suffix)
        };
        KeyExpr::new(full).map_err(|_| SessionError::KeyExprNotCanonical)
    }

    /// Subscriptions of `kind` whose key intersects `key`, snapshotted.
    pub fn matching_subscriptions(
        &self,
        kind: SubscriberKind,
        key: &KeyExpr,
    ) -> Vec<Arc<SubscriptionEntity>> {
        self.subscriptions
            .values()
            .filter(|s| s.kind == kind && s.key.intersects(key))
            .cloned()
            .collect()
    }

    /// Queryables whose key intersects `key`, snapshotted.
    pub fn matching_queryables(&self, key: &KeyExpr) -> Vec<Arc<QueryableEntity>> {
        self.queryables
            .values()
            .filter(|q| q.key.intersects(key))
            .cloned()
            .collect()
    }
}
