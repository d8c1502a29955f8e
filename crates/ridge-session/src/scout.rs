//! Scouting: discover routers and peers over the multicast locator.

use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use ridge_link::{Endpoint, Link};
use ridge_proto::codec::scouting as scodec;
use ridge_proto::core::PROTOCOL_VERSION;
use ridge_proto::iobuf::{WBuf, ZBuf};
use ridge_proto::msg::{Hello, Scout, ScoutingMessage};
use ridge_proto::PeerId;

use crate::config::Config;
use crate::error::SessionError;

/// Send one SCOUT on the configured multicast locator and collect HELLO
/// answers until the timeout elapses — or until the first one when
/// `exit_on_first`.
///
/// Malformed datagrams are dropped and logged; they never abort the scout.
pub async fn scout(what: u8, config: &Config, exit_on_first: bool) -> Result<Vec<Hello>, SessionError> {
    let endpoint = Endpoint::parse(&config.scout_locator)?;
    let link = Link::open(&endpoint).await?;

    let msg = ScoutingMessage::Scout(Scout {
        version: PROTOCOL_VERSION,
        what,
        zid: Some(PeerId::random()),
    });
    let mut w = WBuf::fixed(link.mtu());
    scodec::encode(&mut w, &msg)?;
    link.send_batch(w.as_slice()).await?;
    tracing::debug!(what, locator = %endpoint, "scout sent");

    let deadline = Instant::now() + Duration::from_millis(config.scouting_timeout_ms);
    let mut hellos = Vec::new();
    loop {
        let (batch, src) = match timeout_at(deadline, link.recv_batch()).await {
            Err(_) => break,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "scout receive failed");
                break;
            }
            Ok(Ok(r)) => r,
        };
        let mut r = ZBuf::new(batch);
        match scodec::decode(&mut r) {
            Ok(ScoutingMessage::Hello(hello)) => {
                tracing::info!(zid = %hello.zid, ?src, "hello received");
                hellos.push(hello);
                if exit_on_first {
                    break;
                }
            }
            Ok(ScoutingMessage::Scout(_)) => {
                // Somebody else scouting the same group.
            }
            Err(e) => {
                tracing::debug!(error = %e, ?src, "malformed scouting datagram dropped");
            }
        }
    }
    link.close().await;
    Ok(hellos)
}
