//! In-memory form of every wire message.
//!
//! The encode/decode pairs live in [`crate::codec`]; these modules only
//! define the shapes and their constructors.

pub mod declare;
pub mod network;
pub mod scouting;
pub mod transport;

pub use declare::{Declaration, QueryableInfo};
pub use network::{
    Del, InterestMsg, InterestOptions, Mapping, NetworkMessage, Push, PushBody, Put, Query,
    QueryBody, Reply, ReplyErr, Request, RequestBody, Response, ResponseBody, ResponseFinal,
    SessionDeclare, WireKeyExpr,
};
pub use scouting::{Hello, Scout, ScoutingMessage};
pub use transport::{
    Close, Fragment, Frame, Init, Join, KeepAlive, Open, Reliability, TransportMessage,
};
