//! Inbound dispatch: turn network messages into callback invocations.
//!
//! Matching entities are snapshotted under the inner lock and invoked after
//! it is released. Within one frame, invocation order is wire order.

use std::sync::{Arc, Weak};

use bytes::Bytes;

use ridge_proto::msg::network::{
    NetworkMessage, Push, PushBody, Request, RequestBody, Response, ResponseBody, ResponseFinal,
    InterestMsg, InterestOptions, SessionDeclare, WireKeyExpr,
};
use ridge_proto::msg::{Declaration, Reliability};
use ridge_proto::{CongestionControl, KeyExpr, PeerId, QoS, Sample, SampleKind, WhatAmI};
use ridge_transport::{DisconnectReason, TransportEventHandler};

use crate::query::{Query, Reply, Responder};
use crate::state::SubscriberKind;
use crate::Session;

/// The transport-facing face of a session.
///
/// Holds the session weakly: a transport that outlives its session simply
/// drops the event on the floor.
pub(crate) struct SessionHandler {
    pub(crate) session: Weak<Session>,
}

impl TransportEventHandler for SessionHandler {
    fn handle_message(&self, peer: &PeerId, msg: NetworkMessage) {
        if let Some(session) = self.session.upgrade() {
            session.dispatch_message(peer, msg);
        }
    }

    fn peer_connected(&self, peer: &PeerId, whatami: WhatAmI) {
        if let Some(session) = self.session.upgrade() {
            session.on_peer_connected(peer, whatami);
        }
    }

    fn peer_disconnected(&self, peer: &PeerId, reason: DisconnectReason) {
        if let Some(session) = self.session.upgrade() {
            session.on_peer_disconnected(peer, reason);
        }
    }
}

impl Session {
    pub(crate) fn dispatch_message(self: &Arc<Self>, peer: &PeerId, msg: NetworkMessage) {
        match msg {
            NetworkMessage::Push(m) => self.dispatch_push(peer, m),
            NetworkMessage::Request(m) => self.dispatch_request(peer, m),
            NetworkMessage::Response(m) => self.dispatch_response(peer, m),
            NetworkMessage::ResponseFinal(m) => self.dispatch_response_final(m),
            NetworkMessage::Declare(m) => self.dispatch_declare(peer, m),
            NetworkMessage::Interest(m) => self.dispatch_interest(peer, m),
        }
    }

    fn dispatch_push(self: &Arc<Self>, peer: &PeerId, push: Push) {
        let (key, subs) = {
            let state = self.state();
            let key = match state.expand(peer, &push.key) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(error = %e, "push with unresolvable key dropped");
                    return;
                }
            };
            let subs = state.matching_subscriptions(SubscriberKind::Regular, &key);
            (key, subs)
        };
        let sample = sample_from_push(key, &push);
        for sub in subs {
            sub.callback.invoke(sample.clone());
        }
    }

    fn dispatch_request(self: &Arc<Self>, peer: &PeerId, request: Request) {
        let RequestBody::Query(query) = request.body;
        let (key, queryables) = {
            let state = self.state();
            let key = match state.expand(peer, &request.key) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(error = %e, "query with unresolvable key dropped");
                    return;
                }
            };
            let queryables = state.matching_queryables(&key);
            (key, queryables)
        };

        if queryables.is_empty() {
            // Nobody will answer; unblock the querier right away.
            let session = self.clone();
            let peer = *peer;
            let fin = NetworkMessage::ResponseFinal(ResponseFinal { id: request.id });
            self.runtime().spawn(async move {
                let _ = session
                    .send_to_peer(&peer, &fin, Reliability::Reliable, CongestionControl::Block)
                    .await;
            });
            return;
        }

        let responder = Responder::spawn(self, *peer, request.id);
        let handle = Query {
            key,
            parameters: query.parameters,
            payload: query.body.map(|b| (b.encoding, b.payload)),
            attachment: query.attachment,
            responder,
        };
        for queryable in queryables {
            queryable.callback.invoke(handle.clone());
        }
    }

    fn dispatch_response(self: &Arc<Self>, peer: &PeerId, response: Response) {
        let (callback, reply) = {
            let state = self.state();
            let Some(pending) = state.pending_queries.get(&response.id) else {
                tracing::debug!(id = response.id, "response for unknown query dropped");
                return;
            };
            let reply = match response.body {
                ResponseBody::Reply(r) => {
                    let key = match state.expand(peer, &response.key) {
                        Ok(k) => k,
                        Err(e) => {
                            tracing::warn!(error = %e, "reply with unresolvable key dropped");
                            return;
                        }
                    };
                    Reply::Sample(Sample {
                        key,
                        payload: r.payload,
                        encoding: r.encoding,
                        kind: SampleKind::Put,
                        timestamp: r.timestamp,
                        attachment: r.attachment,
                        qos: response.qos,
                    })
                }
                ResponseBody::Err(e) => Reply::Error {
                    code: e.code,
                    payload: e.payload,
                },
            };
            (pending.callback.clone(), reply)
        };
        callback.invoke(reply);
    }

    fn dispatch_response_final(self: &Arc<Self>, fin: ResponseFinal) {
        let pending = self.state().pending_queries.remove(&fin.id);
        match pending {
            Some(pq) => pq.finish(),
            None => tracing::debug!(id = fin.id, "final for unknown query dropped"),
        }
    }

    fn dispatch_declare(self: &Arc<Self>, peer: &PeerId, declare: SessionDeclare) {
        let SessionDeclare {
            interest_id,
            declaration,
        } = declare;

        // State effects first, then routing.
        match &declaration {
            Declaration::KeyExpr { id, suffix } => {
                let mut state = self.state();
                if let Some(old) = state
                    .remote_mappings
                    .insert((*peer, *id), suffix.clone())
                {
                    if old != *suffix {
                        tracing::warn!(
                            id,
                            old = %old,
                            new = %suffix,
                            "duplicate keyexpr declaration, replacing"
                        );
                    }
                }
                return;
            }
            Declaration::UndeclKeyExpr { id } => {
                self.state().remote_mappings.remove(&(*peer, *id));
                return;
            }
            Declaration::Token { id, key } => {
                let (sample, subs) = {
                    let mut state = self.state();
                    let key = match state.expand(peer, key) {
                        Ok(k) => k,
                        Err(e) => {
                            tracing::warn!(error = %e, "token with unresolvable key dropped");
                            return;
                        }
                    };
                    state.remote_tokens.insert((*peer, *id), key.clone());
                    let subs = state.matching_subscriptions(SubscriberKind::Liveliness, &key);
                    (liveliness_sample(key, SampleKind::Put), subs)
                };
                for sub in subs {
                    sub.callback.invoke(sample.clone());
                }
            }
            Declaration::UndeclToken { id, .. } => {
                let fired = {
                    let mut state = self.state();
                    state.remote_tokens.remove(&(*peer, *id)).map(|key| {
                        let subs =
                            state.matching_subscriptions(SubscriberKind::Liveliness, &key);
                        (liveliness_sample(key, SampleKind::Delete), subs)
                    })
                };
                if let Some((sample, subs)) = fired {
                    for sub in subs {
                        sub.callback.invoke(sample.clone());
                    }
                }
            }
            _ => {}
        }

        // Routing: a tagged declaration goes to its interest; everything
        // else fans out to interests whose options and key match.
        let interests = {
            let state = self.state();
            match interest_id {
                Some(id) => state.interests.get(&id).cloned().into_iter().collect(),
                None => {
                    let key = declaration_key(&state, peer, &declaration);
                    state
                        .interests
                        .values()
                        .filter(|i| {
                            interest_wants(i.options, &declaration)
                                && match (&i.key, &key) {
                                    (Some(ik), Some(dk)) => ik.intersects(dk),
                                    _ => true,
                                }
                        })
                        .cloned()
                        .collect::<Vec<_>>()
                }
            }
        };
        for interest in interests {
            interest.callback.invoke(declaration.clone());
        }
    }

    fn dispatch_interest(self: &Arc<Self>, peer: &PeerId, interest: InterestMsg) {
        if !interest.options.contains(InterestOptions::CURRENT) {
            return;
        }
        // Replay our matching declarations, then close with a tagged final.
        let restriction = {
            let state = self.state();
            match &interest.key {
                Some(ke) => match state.expand(peer, ke) {
                    Ok(k) => Some(k),
                    Err(e) => {
                        tracing::warn!(error = %e, "interest with unresolvable key dropped");
                        return;
                    }
                },
                None => None,
            }
        };
        let mut replay = Vec::new();
        {
            let state = self.state();
            let matches =
                |k: &KeyExpr| restriction.as_ref().map(|r| r.intersects(k)).unwrap_or(true);
            if interest.options.contains(InterestOptions::SUBSCRIBERS) {
                for sub in state.subscriptions.values() {
                    if sub.kind == SubscriberKind::Regular && matches(&sub.key) {
                        replay.push(Declaration::Subscriber {
                            id: sub.id,
                            key: WireKeyExpr::from_str(sub.key.as_str()),
                        });
                    }
                }
            }
            if interest.options.contains(InterestOptions::QUERYABLES) {
                for q in state.queryables.values() {
                    if matches(&q.key) {
                        replay.push(Declaration::Queryable {
                            id: q.id,
                            key: WireKeyExpr::from_str(q.key.as_str()),
                            info: ridge_proto::msg::QueryableInfo {
                                complete: q.complete,
                                distance: 0,
                            },
                        });
                    }
                }
            }
            if interest.options.contains(InterestOptions::TOKENS) {
                for (id, key) in state.tokens.iter() {
                    if matches(key) {
                        replay.push(Declaration::Token {
                            id: *id,
                            key: WireKeyExpr::from_str(key.as_str()),
                        });
                    }
                }
            }
        }
        replay.push(Declaration::Final);

        let session = self.clone();
        let peer = *peer;
        let interest_id = interest.id;
        self.runtime().spawn(async move {
            for declaration in replay {
                let msg = NetworkMessage::Declare(SessionDeclare {
                    interest_id: Some(interest_id),
                    declaration,
                });
                if let Err(e) = session
                    .send_to_peer(&peer, &msg, Reliability::Reliable, CongestionControl::Block)
                    .await
                {
                    tracing::debug!(error = %e, "interest replay send failed");
                    return;
                }
            }
        });
    }
}

fn sample_from_push(key: KeyExpr, push: &Push) -> Sample {
    match &push.body {
        PushBody::Put(p) => Sample {
            key,
            payload: p.payload.clone(),
            encoding: p.encoding.clone(),
            kind: SampleKind::Put,
            timestamp: p.timestamp,
            attachment: p.attachment.clone(),
            qos: push.qos,
        },
        PushBody::Del(d) => Sample {
            key,
            payload: Bytes::new(),
            encoding: Default::default(),
            kind: SampleKind::Delete,
            timestamp: d.timestamp,
            attachment: None,
            qos: push.qos,
        },
    }
}

fn liveliness_sample(key: KeyExpr, kind: SampleKind) -> Sample {
    Sample {
        key,
        payload: Bytes::new(),
        encoding: Default::default(),
        kind,
        timestamp: None,
        attachment: None,
        qos: QoS::default(),
    }
}

/// The key a declaration talks about, if it has one we can resolve.
fn declaration_key(
    state: &crate::state::SessionState,
    peer: &PeerId,
    declaration: &Declaration,
) -> Option<KeyExpr> {
    let wire = match declaration {
        Declaration::Subscriber { key, .. }
        | Declaration::Queryable { key, .. }
        | Declaration::Token { key, .. } => Some(key),
        Declaration::UndeclSubscriber { key, .. }
        | Declaration::UndeclQueryable { key, .. }
        | Declaration::UndeclToken { key, .. } => key.as_ref(),
        _ => None,
    }?;
    state.expand(peer, wire).ok()
}

fn interest_wants(options: u8, declaration: &Declaration) -> bool {
    match declaration {
        Declaration::KeyExpr { .. } | Declaration::UndeclKeyExpr { .. } => {
            options & InterestOptions::KEYEXPRS != 0
        }
        Declaration::Subscriber { .. } | Declaration::UndeclSubscriber { .. } => {
            options & InterestOptions::SUBSCRIBERS != 0
        }
        Declaration::Queryable { .. } | Declaration::UndeclQueryable { .. } => {
            options & InterestOptions::QUERYABLES != 0
        }
        Declaration::Token { .. } | Declaration::UndeclToken { .. } => {
            options & InterestOptions::TOKENS != 0
        }
        Declaration::Final => true,
    }
}
