//! Component N: packet fan-in. Demultiplexes inbound datagrams into the
//! STUN/RTCP/RTP components above and routes their output back to the
//! socket layer (`spec.md` §2 "Glue").

use bytes::Bytes;

use crate::clock::MonoMs;
use crate::error::RtcCoreError;
use crate::ice_server::{Credentials, IceServer, IceServerListener};
use crate::key_frame_request_manager::{KeyFrameListener, KeyFrameRequestManager};
use crate::nack_generator::NackGenerator;
use crate::retransmission_buffer::RetransmissionBuffer;
use crate::rtcp::{self, header::PT_PSFB, header::PT_RTPFB, FMT_NACK, FMT_PLI, FMT_TCC};
use crate::rtp::extensions::{for_each_one_byte_extension, parse_abs_send_time, parse_transport_cc_wide_seq};
use crate::rtp::RtpPacket;
use crate::stun::message::is_stun;
use crate::tcc::{RembServer, TccServer};
use crate::transport::TransportTuple;

/// Negotiated one-byte RTP extension ids for the two extensions this core
/// consumes; the SDP/control plane out of scope here picks the values.
#[derive(Clone, Copy, Debug)]
pub struct ExtensionIds {
    pub abs_send_time: u8,
    pub transport_cc: u8,
}

/// What the router asks its caller to do after handling one inbound
/// datagram: send a reply on the same tuple, and/or forward the RTP
/// payload to the media consumer path.
#[derive(Default)]
pub struct RouteOutcome {
    pub replies: Vec<Bytes>,
    pub key_frame_requests: Vec<u32>,
    pub forwarded_rtp: Option<RtpPacket>,
}

/// Routes inbound datagrams for a single transport to the ICE, NACK,
/// key-frame-request, TCC-server and REMB components, per the dataflow
/// table in `spec.md` §2: "RTP-marked packets land in ICE during
/// handshake, then feed G, D, and H".
pub struct PacketRouter {
    pub ice: IceServer,
    nack: NackGenerator,
    key_frame: KeyFrameRequestManager,
    retransmission: RetransmissionBuffer,
    tcc_server: TccServer,
    remb: RembServer,
    extension_ids: ExtensionIds,
    /// SSRC of the most recently routed RTP packet; stamped onto
    /// locally-built NACK packets as `media_ssrc` since this router does
    /// not otherwise track a per-producer identity (`tcc::server::TccServer`
    /// does the same for its feedback's `media_ssrc`).
    latest_media_ssrc: u32,
}

impl PacketRouter {
    #[must_use]
    pub fn new(
        extension_ids: ExtensionIds,
        credentials: Credentials,
        consent_timeout_enabled: bool,
        max_retransmission_items: usize,
        clock_rate: u32,
        max_retransmission_delay_ms: u64,
        key_frame_delay_ms: u64,
    ) -> Self {
        Self {
            ice: IceServer::new(credentials, consent_timeout_enabled),
            nack: NackGenerator::new(),
            key_frame: KeyFrameRequestManager::new(key_frame_delay_ms),
            retransmission: RetransmissionBuffer::new(max_retransmission_items, clock_rate, max_retransmission_delay_ms),
            tcc_server: TccServer::new(),
            remb: RembServer::new(),
            extension_ids,
            latest_media_ssrc: 0,
        }
    }

    /// One inbound datagram, already associated with `tuple`. Returns the
    /// replies/forwarding the caller should act on.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        tuple: TransportTuple,
        now_ms: MonoMs,
        listener: &mut (impl IceServerListener + KeyFrameListener),
    ) -> Result<RouteOutcome, RtcCoreError> {
        let mut outcome = RouteOutcome::default();

        if is_stun(data) {
            if let Some(reply) = self
                .ice
                .process_stun_packet(data, tuple, now_ms, listener)?
            {
                outcome.replies.push(reply);
            }
            return Ok(outcome);
        }

        if self.ice.selected_tuple() != Some(tuple) {
            // RTP/RTCP outside the selected 4-tuple is dropped; only the
            // ICE-selected path is trusted for media, per `spec.md` §4.F.
            return Ok(outcome);
        }

        if is_rtcp(data) {
            self.handle_rtcp(data, &mut outcome, listener);
            return Ok(outcome);
        }

        let packet = RtpPacket::parse(Bytes::copy_from_slice(data))?;
        self.handle_rtp(&packet, now_ms, &mut outcome, listener);
        outcome.forwarded_rtp = Some(packet);
        Ok(outcome)
    }

    fn handle_rtp(
        &mut self,
        packet: &RtpPacket,
        now_ms: MonoMs,
        outcome: &mut RouteOutcome,
        listener: &mut impl KeyFrameListener,
    ) {
        self.latest_media_ssrc = packet.ssrc();

        let mut abs_send_time_24 = None;
        let mut wide_seq = None;
        if let Some(block) = packet.extension_block() {
            for_each_one_byte_extension(block, |id, data| {
                if id == self.extension_ids.abs_send_time {
                    abs_send_time_24 = parse_abs_send_time(data);
                } else if id == self.extension_ids.transport_cc {
                    wide_seq = parse_transport_cc_wide_seq(data);
                }
            });
        }

        let nack_outcome = self.nack.receive_packet(packet.sequence_number());
        if nack_outcome.key_frame_required {
            self.key_frame.key_frame_needed(packet.ssrc(), now_ms, listener);
            outcome.key_frame_requests.push(packet.ssrc());
        }

        if let Some(seq16) = wide_seq {
            let extended = self.nack_extended_seq_hint(seq16);
            self.tcc_server.incoming_packet(extended, now_ms, packet.ssrc());
        }

        if let Some(abs_24) = abs_send_time_24 {
            let send_ms = (crate::rtp::extensions::abs_send_time_to_32_bits(abs_24) as i64) >> 8;
            self.remb.incoming_packet(send_ms, now_ms, packet.len());
        }
    }

    fn nack_extended_seq_hint(&self, seq16: u16) -> u32 {
        // Transport-cc wide sequence numbers and RTP sequence numbers are
        // independent spaces; the TCC server only needs monotonic
        // ordering within a feedback window, which the 16-bit value
        // already gives it for any single flush period.
        seq16 as u32
    }

    fn handle_rtcp(&mut self, data: &[u8], outcome: &mut RouteOutcome, listener: &mut impl KeyFrameListener) {
        if data.len() < 2 {
            return;
        }
        let packet_type = data[1];
        let fmt = data[0] & 0x1F;
        match packet_type {
            PT_RTPFB if fmt == FMT_NACK => {
                if let Ok((_, _, seqs)) = rtcp::parse_nack_packet(data) {
                    for seq in seqs {
                        if let Some(item) = self.retransmission.get(seq) {
                            outcome.replies.push(item.packet.clone());
                        }
                    }
                }
            }
            PT_RTPFB if fmt == FMT_TCC => {
                // Transport-cc feedback is destined for the send-side
                // `TccClient`, which lives on the orchestrator, not here.
            }
            PT_PSFB if fmt == FMT_PLI => {
                if let Ok((_, media_ssrc)) = rtcp::parse_pli(data) {
                    listener.request_key_frame(media_ssrc);
                    outcome.key_frame_requests.push(media_ssrc);
                }
            }
            PT_PSFB if fmt == crate::rtcp::header::FMT_FIR => {
                if let Ok((_, target_ssrc, _)) = rtcp::parse_fir(data) {
                    listener.request_key_frame(target_ssrc);
                    outcome.key_frame_requests.push(target_ssrc);
                }
            }
            _ => {}
        }
    }

    /// Drives NACK retry batching and key-frame retry timeouts. Returns any
    /// RTCP Generic NACK packets the caller should send on the selected
    /// tuple.
    pub fn poll(&mut self, now_ms: MonoMs, listener: &mut impl KeyFrameListener) -> Vec<Bytes> {
        let seqs = self.nack.seq_filter_batch(now_ms);
        let nacks = if seqs.is_empty() {
            Vec::new()
        } else {
            rtcp::build_nack_packets(0, self.latest_media_ssrc, &seqs)
        };
        self.key_frame.poll(now_ms, listener);
        nacks
    }
}

fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (200..=204).contains(&data[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;
    use std::net::SocketAddr;

    struct NullListener;
    impl IceServerListener for NullListener {
        fn on_tuple_added(&mut self, _tuple: TransportTuple) {}
        fn on_state_changed(&mut self, _state: crate::ice_server::IceState) {}
        fn on_old_ufrag_released(&mut self, _ufrag: String) {}
    }
    impl KeyFrameListener for NullListener {
        fn request_key_frame(&mut self, _ssrc: u32) {}
    }

    fn tuple() -> TransportTuple {
        TransportTuple::new(
            "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
            "127.0.0.1:2".parse::<SocketAddr>().unwrap(),
            Protocol::Udp,
        )
    }

    fn credentials() -> Credentials {
        Credentials {
            local_ufrag: "lfrag".to_string(),
            local_password: "lpwd".to_string(),
        }
    }

    fn rtp_packet(seq: u16, ssrc: u32) -> RtpPacket {
        let mut buf = vec![0x80u8, 96];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        RtpPacket::parse(Bytes::from(buf)).unwrap()
    }

    fn router() -> PacketRouter {
        PacketRouter::new(
            ExtensionIds { abs_send_time: 1, transport_cc: 2 },
            credentials(),
            false,
            100,
            90_000,
            2_000,
            0,
        )
    }

    #[test]
    fn poll_builds_a_nack_packet_for_a_pending_gap() {
        let mut router = router();
        let mut listener = NullListener;
        let mut outcome = RouteOutcome::default();
        router.handle_rtp(&rtp_packet(1, 0xdead_beef), MonoMs(0), &mut outcome, &mut listener);
        router.handle_rtp(&rtp_packet(3, 0xdead_beef), MonoMs(0), &mut outcome, &mut listener);
        assert_eq!(router.nack.pending_count(), 1);

        let nacks = router.poll(MonoMs(0), &mut listener);
        assert_eq!(nacks.len(), 1);
        let (_, media_ssrc, seqs) = rtcp::parse_nack_packet(&nacks[0]).unwrap();
        assert_eq!(media_ssrc, 0xdead_beef);
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn poll_is_silent_with_no_pending_nacks() {
        let mut router = router();
        let mut listener = NullListener;
        assert!(router.poll(MonoMs(0), &mut listener).is_empty());
    }

    #[test]
    fn nack_list_overflow_surfaces_a_key_frame_request() {
        let mut router = router();
        let mut listener = NullListener;
        let mut outcome = RouteOutcome::default();
        router.handle_rtp(&rtp_packet(0, 7), MonoMs(0), &mut outcome, &mut listener);
        router.handle_rtp(&rtp_packet(1200, 7), MonoMs(0), &mut outcome, &mut listener);
        assert_eq!(outcome.key_frame_requests, vec![7]);
    }

    #[test]
    fn inbound_nack_replies_with_the_stored_packet() {
        let mut router = router();
        let mut listener = NullListener;
        let packet = rtp_packet(10, 7);
        // Pretend this packet was sent out and kept for retransmission.
        router
            .retransmission
            .insert(packet.as_bytes().clone(), 7, 10, 0);

        let nack = rtcp::build_nack_packets(1, 7, &[10]);
        let mut outcome = RouteOutcome::default();
        router.handle_rtcp(&nack[0], &mut outcome, &mut listener);
        assert_eq!(outcome.replies, vec![packet.as_bytes().clone()]);
    }

    #[test]
    fn non_stun_non_rtcp_before_selection_is_dropped() {
        let mut router = PacketRouter::new(
            ExtensionIds { abs_send_time: 1, transport_cc: 2 },
            credentials(),
            false,
            100,
            90_000,
            2_000,
            1_000,
        );
        let mut listener = NullListener;
        let rtp = [0x80u8, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        let outcome = router
            .handle_datagram(&rtp, tuple(), MonoMs(0), &mut listener)
            .unwrap();
        assert!(outcome.forwarded_rtp.is_none());
    }

    #[test]
    fn rtcp_detection_by_payload_type() {
        assert!(is_rtcp(&[0x80, 200, 0, 0]));
        assert!(!is_rtcp(&[0x80, 96, 0, 0]));
    }
}
