//! Machinery shared by the unicast and multicast transports: the SN ring,
//! batch assembly, and outbound fragmentation.

use ridge_link::Link;
use ridge_proto::codec::transport::{tmid, FLAG_M, FLAG_R};
use ridge_proto::codec::{core as codec_core, network};
use ridge_proto::core::{
    DEFAULT_BATCH_SIZE, DEFAULT_LEASE_MS, DEFAULT_SN_RESOLUTION, LEASE_KEEPALIVE_FACTOR,
};
use ridge_proto::iobuf::WBuf;
use ridge_proto::msg::{NetworkMessage, Reliability, TransportMessage};
use ridge_proto::{PeerId, ProtoError, WhatAmI};

use crate::TransportError;

/// Parameters a transport is opened with. The unicast handshake may
/// negotiate some of them down.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub zid: PeerId,
    pub whatami: WhatAmI,
    pub sn_resolution: u64,
    pub batch_size: u16,
    pub lease_ms: u64,
    /// Per-peer, per-channel defragmentation budget in bytes. 0 = unlimited.
    pub defrag_budget: usize,
}

impl TransportConfig {
    pub fn new(zid: PeerId, whatami: WhatAmI) -> Self {
        Self {
            zid,
            whatami,
            sn_resolution: DEFAULT_SN_RESOLUTION,
            batch_size: DEFAULT_BATCH_SIZE,
            lease_ms: DEFAULT_LEASE_MS,
            defrag_budget: 0,
        }
    }

    /// Keepalive and lease-bookkeeping period.
    pub fn lease_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            (self.lease_ms / u64::from(LEASE_KEEPALIVE_FACTOR)).max(1),
        )
    }
}

// ── Sequence numbers ──────────────────────────────────────────────────────────

/// Does `next` come after `last` on the ring `[0, res)`?
///
/// Duplicates do not precede themselves: a frame re-sent with the last
/// accepted SN must be dropped, not delivered twice.
pub fn sn_precedes(res: u64, last: u64, next: u64) -> bool {
    debug_assert!(last < res && next < res);
    let d = (next + res - last) % res;
    d != 0 && d < res / 2
}

pub fn sn_increment(res: u64, sn: u64) -> u64 {
    (sn + 1) % res
}

pub fn sn_decrement(res: u64, sn: u64) -> u64 {
    (sn + res - 1) % res
}

/// Draw a random initial SN below `res`.
pub fn sn_random(res: u64) -> u64 {
    rand::Rng::gen_range(&mut rand::thread_rng(), 0..res)
}

/// Bytes a VLE encoding of `v` occupies.
fn vle_len(v: u64) -> usize {
    if v == 0 {
        1
    } else {
        (64 - v.leading_zeros() as usize).div_ceil(7)
    }
}

// ── Outbound state ────────────────────────────────────────────────────────────

/// Everything the tx lock guards: the batch buffer and the outbound SNs.
pub struct TxState {
    batch: WBuf,
    mtu: usize,
    sn_resolution: u64,
    sn_reliable: u64,
    sn_best_effort: u64,
}

impl TxState {
    pub fn new(mtu: usize, sn_resolution: u64, initial_sn: u64) -> Self {
        Self {
            batch: WBuf::fixed(mtu),
            mtu,
            sn_resolution,
            sn_reliable: initial_sn,
            sn_best_effort: initial_sn,
        }
    }

    pub fn next_sn(&mut self, reliability: Reliability) -> u64 {
        let slot = match reliability {
            Reliability::Reliable => &mut self.sn_reliable,
            Reliability::BestEffort => &mut self.sn_best_effort,
        };
        let sn = *slot;
        *slot = sn_increment(self.sn_resolution, sn);
        sn
    }

    /// The SN the next frame of `reliability` will carry.
    pub fn peek_sn(&self, reliability: Reliability) -> u64 {
        match reliability {
            Reliability::Reliable => self.sn_reliable,
            Reliability::BestEffort => self.sn_best_effort,
        }
    }
}

fn encode_frame_header(
    w: &mut WBuf,
    reliability: Reliability,
    sn: u64,
) -> Result<(), ProtoError> {
    let mut header = tmid::FRAME;
    if reliability == Reliability::Reliable {
        header |= FLAG_R;
    }
    w.write_u8(header)?;
    codec_core::encode_zint(w, sn)
}

fn encode_fragment_header(
    w: &mut WBuf,
    reliability: Reliability,
    more: bool,
    sn: u64,
) -> Result<(), ProtoError> {
    let mut header = tmid::FRAGMENT;
    if reliability == Reliability::Reliable {
        header |= FLAG_R;
    }
    if more {
        header |= FLAG_M;
    }
    w.write_u8(header)?;
    codec_core::encode_zint(w, sn)
}

/// Chunk size into which an oversized message is split: the batch, minus
/// the fragment header and a worst-case SN for this resolution.
fn fragment_chunk(mtu: usize, sn_resolution: u64) -> usize {
    mtu.saturating_sub(1 + vle_len(sn_resolution - 1))
}

/// Send one network message, fragmenting it when it cannot fit a batch.
///
/// Called with the tx lock held.
pub async fn transmit(
    link: &Link,
    tx: &mut TxState,
    msg: &NetworkMessage,
    reliability: Reliability,
) -> Result<(), TransportError> {
    let sn = tx.next_sn(reliability);
    tx.batch.clear();
    encode_frame_header(&mut tx.batch, reliability, sn)?;
    match network::encode(&mut tx.batch, msg) {
        Ok(()) => {
            link.send_batch(tx.batch.as_slice()).await?;
            Ok(())
        }
        Err(ProtoError::Full) => {
            let mut staging = WBuf::expandable(4096);
            network::encode(&mut staging, msg)?;
            let mut payload = staging.to_zbuf();
            let chunk = fragment_chunk(tx.mtu, tx.sn_resolution);
            let total = payload.remaining();
            tracing::trace!(total, chunk, "fragmenting oversized message");

            let mut frag_sn = sn;
            loop {
                let n = chunk.min(payload.remaining());
                let piece = payload.read_exact(n).ok_or(ProtoError::ParseBytes)?;
                let more = payload.can_read();
                tx.batch.clear();
                encode_fragment_header(&mut tx.batch, reliability, more, frag_sn)?;
                tx.batch.write_bytes(&piece)?;
                link.send_batch(tx.batch.as_slice()).await?;
                if !more {
                    return Ok(());
                }
                frag_sn = tx.next_sn(reliability);
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Send a bare transport message (KEEP_ALIVE, CLOSE, JOIN, handshake).
pub async fn transmit_transport(
    link: &Link,
    tx: &mut TxState,
    msg: &TransportMessage,
) -> Result<(), TransportError> {
    tx.batch.clear();
    ridge_proto::codec::transport::encode(&mut tx.batch, msg)?;
    link.send_batch(tx.batch.as_slice()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sn_precedes_adjacent_and_far() {
        // Ring properties, for several resolutions.
        for res in [2u64, 16, 1 << 28] {
            for a in [0, 1, res / 2, res - 1] {
                assert!(sn_precedes(res, a, (a + 1) % res), "res={res} a={a}");
                assert!(
                    !sn_precedes(res, a, (a + res / 2 + 1) % res),
                    "res={res} a={a}"
                );
            }
        }
    }

    #[test]
    fn sn_duplicates_are_rejected() {
        for res in [16u64, 1 << 28] {
            for a in [0, 5, res - 1] {
                assert!(!sn_precedes(res, a, a));
            }
        }
    }

    #[test]
    fn sn_acceptance_across_wrap() {
        // With res = 16 and sn_rx = 14: sn 1 wrapped forward is accepted,
        // sn 7 is half a ring away and rejected.
        assert!(sn_precedes(16, 14, 1));
        assert!(!sn_precedes(16, 14, 7));
    }

    #[test]
    fn sn_stale_after_wrap_is_rejected() {
        // Second cycle at sn_rx = 1; a stale frame from the previous cycle.
        assert!(!sn_precedes(16, 1, 14));
    }

    #[test]
    fn sn_increment_wraps() {
        assert_eq!(sn_increment(16, 15), 0);
        assert_eq!(sn_decrement(16, 0), 15);
    }

    #[test]
    fn tx_state_hands_out_consecutive_sns_per_channel() {
        let mut tx = TxState::new(256, 16, 14);
        assert_eq!(tx.next_sn(Reliability::Reliable), 14);
        assert_eq!(tx.next_sn(Reliability::Reliable), 15);
        assert_eq!(tx.next_sn(Reliability::Reliable), 0);
        // Channels are independent.
        assert_eq!(tx.next_sn(Reliability::BestEffort), 14);
    }

    #[test]
    fn fragment_chunk_accounts_for_header() {
        // Default resolution needs a 4-byte SN at worst.
        assert_eq!(fragment_chunk(256, 1 << 28), 256 - 5);
        assert_eq!(fragment_chunk(256, 16), 256 - 2);
    }
}
