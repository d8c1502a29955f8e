//! Query handles and replies.
//!
//! A [`Query`] is handed to every matching queryable callback. Replies are
//! funneled through a per-request ordered channel; when the last handle is
//! dropped the channel closes and a RESPONSE_FINAL goes out automatically.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use ridge_proto::msg::network::{
    NetworkMessage, Reply as WireReply, ReplyErr, Response, ResponseBody, ResponseFinal,
    WireKeyExpr,
};
use ridge_proto::msg::Reliability;
use ridge_proto::{CongestionControl, Encoding, KeyExpr, PeerId, Sample};

use crate::error::SessionError;
use crate::Session;

/// One answer delivered to a `get` callback.
#[derive(Debug, Clone)]
pub enum Reply {
    Sample(Sample),
    Error { code: u16, payload: Bytes },
}

/// A live query against one of this session's queryables.
///
/// Cloneable; the query stays open until every clone is gone.
#[derive(Clone)]
pub struct Query {
    pub(crate) key: KeyExpr,
    pub(crate) parameters: String,
    pub(crate) payload: Option<(Encoding, Bytes)>,
    pub(crate) attachment: Option<Bytes>,
    pub(crate) responder: Arc<Responder>,
}

impl Query {
    /// The key the query was addressed to.
    pub fn key(&self) -> &KeyExpr {
        &self.key
    }

    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref().map(|(_, p)| p)
    }

    pub fn encoding(&self) -> Option<&Encoding> {
        self.payload.as_ref().map(|(e, _)| e)
    }

    pub fn attachment(&self) -> Option<&Bytes> {
        self.attachment.as_ref()
    }

    /// Send one reply sample to the querier.
    pub fn reply(&self, key: &str, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        self.reply_with(key, payload, Encoding::empty())
    }

    pub fn reply_with(
        &self,
        key: &str,
        payload: impl Into<Bytes>,
        encoding: Encoding,
    ) -> Result<(), SessionError> {
        let key = KeyExpr::new(key).map_err(|_| SessionError::KeyExprNotCanonical)?;
        let msg = NetworkMessage::Response(Response {
            id: self.responder.request_id,
            key: WireKeyExpr::from_str(key.as_str()),
            qos: Default::default(),
            body: ResponseBody::Reply(WireReply {
                timestamp: None,
                encoding,
                payload: payload.into(),
                attachment: None,
            }),
        });
        self.responder.send(msg)
    }

    /// Send an error reply to the querier.
    pub fn reply_err(&self, code: u16, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        let msg = NetworkMessage::Response(Response {
            id: self.responder.request_id,
            key: WireKeyExpr::from_str(self.key.as_str()),
            qos: Default::default(),
            body: ResponseBody::Err(ReplyErr {
                code,
                payload: payload.into(),
            }),
        });
        self.responder.send(msg)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// The shared tail of a query: an ordered pipe back to the querier.
pub(crate) struct Responder {
    pub(crate) request_id: u32,
    tx: mpsc::UnboundedSender<NetworkMessage>,
}

impl Responder {
    /// Spawn the drain task and hand out the shared responder.
    ///
    /// The task forwards replies in submission order and emits the final
    /// response when every [`Query`] clone is gone.
    pub(crate) fn spawn(session: &Arc<Session>, peer: PeerId, request_id: u32) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkMessage>();
        let weak: Weak<Session> = Arc::downgrade(session);
        session.runtime().spawn(async move {
            while let Some(msg) = rx.recv().await {
                match weak.upgrade() {
                    Some(session) => {
                        if let Err(e) = session
                            .send_to_peer(&peer, &msg, Reliability::Reliable, CongestionControl::Block)
                            .await
                        {
                            tracing::warn!(error = %e, "reply send failed");
                        }
                    }
                    None => return,
                }
            }
            // Channel closed: the last query handle is gone.
            if let Some(session) = weak.upgrade() {
                let fin = NetworkMessage::ResponseFinal(ResponseFinal { id: request_id });
                if let Err(e) = session
                    .send_to_peer(&peer, &fin, Reliability::Reliable, CongestionControl::Block)
                    .await
                {
                    tracing::debug!(error = %e, "response-final send failed");
                }
            }
        });
        Arc::new(Self { request_id, tx })
    }

    fn send(&self, msg: NetworkMessage) -> Result<(), SessionError> {
        self.tx.send(msg).map_err(|_| SessionError::Closed)
    }
}
