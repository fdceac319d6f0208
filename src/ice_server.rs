//! ICE-Lite server state machine (`spec.md` §4.F).

use std::collections::VecDeque;

use bytes::BytesMut;
use rand::Rng;

use crate::clock::MonoMs;
use crate::error::{AuthFailure, RtcCoreError};
use crate::stun::message::{self, Class, StunMessage};
use crate::stun::{crypto, Attributes};
use crate::timer::PollTimer;
use crate::transport::TransportTuple;

const MAX_TUPLES: usize = 8;
const CONSENT_PERIOD_MS: u64 = 5_000;
const CONSENT_PERIOD_JITTER: f64 = 0.2;
const CONSENT_TIMEOUT_MS: u64 = 30_000;

/// `CONSENT_PERIOD_MS` jittered by up to `CONSENT_PERIOD_JITTER` in either
/// direction, so consent checks across many transports don't all fire in
/// lockstep (`spec.md` §4.F).
fn jittered_consent_period_ms() -> u64 {
    let factor = rand::thread_rng().gen_range((1.0 - CONSENT_PERIOD_JITTER)..=(1.0 + CONSENT_PERIOD_JITTER));
    (CONSENT_PERIOD_MS as f64 * factor).round() as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
}

/// Credentials accepted for one ICE session generation. During an ICE
/// restart, both the previous and current generations authenticate until
/// the remote side proves it has switched (`spec.md` §4.F "Authentication").
#[derive(Clone, Debug)]
pub struct Credentials {
    pub local_ufrag: String,
    pub local_password: String,
}

pub trait IceServerListener {
    fn on_tuple_added(&mut self, tuple: TransportTuple);
    fn on_state_changed(&mut self, state: IceState);
    /// Fired once a request authenticates against the *new* generation
    /// after a restart, signalling the old ufrag may be released.
    fn on_old_ufrag_released(&mut self, old_ufrag: String);
}

struct OutstandingConsent {
    tag: [u8; 4],
    sent_at_ms: MonoMs,
}

pub struct IceServer {
    current: Credentials,
    previous: Option<Credentials>,
    state: IceState,
    tuples: VecDeque<TransportTuple>,
    selected: Option<TransportTuple>,
    remote_nomination: u32,
    consent_timeout_enabled: bool,
    consent_timer: PollTimer,
    outstanding_consent: Vec<OutstandingConsent>,
    next_consent_tag: u32,
}

impl IceServer {
    #[must_use]
    pub fn new(current: Credentials, consent_timeout_enabled: bool) -> Self {
        Self {
            current,
            previous: None,
            state: IceState::New,
            tuples: VecDeque::new(),
            selected: None,
            remote_nomination: 0,
            consent_timeout_enabled,
            consent_timer: PollTimer::new(),
            outstanding_consent: Vec::new(),
            next_consent_tag: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> IceState {
        self.state
    }

    #[must_use]
    pub fn selected_tuple(&self) -> Option<TransportTuple> {
        self.selected
    }

    /// Starts an ICE restart: the previous credentials remain valid until a
    /// request authenticates against `new_creds`.
    pub fn restart(&mut self, new_creds: Credentials) {
        self.previous = Some(std::mem::replace(&mut self.current, new_creds));
        self.remote_nomination = 0;
    }

    fn matches_current(&self, local_ufrag: &str, password_check: impl Fn(&str) -> bool) -> bool {
        local_ufrag == self.current.local_ufrag && password_check(&self.current.local_password)
    }

    fn authenticate(
        &mut self,
        msg: &StunMessage,
        listener: &mut impl IceServerListener,
    ) -> Result<(), AuthFailure> {
        if !msg.attributes.has_fingerprint {
            return Err(AuthFailure::MissingFingerprint);
        }
        let Some((local_ufrag, _remote_ufrag)) = &msg.attributes.username else {
            return Err(AuthFailure::MissingUsername);
        };
        if msg.attributes.message_integrity.is_none() {
            return Err(AuthFailure::BadMessageIntegrity);
        }
        let mi_offset = msg.raw.len() - 24 - 8; // MI attr (24) + FINGERPRINT attr (8) from the tail.

        if self.matches_current(local_ufrag, |pwd| {
            crypto::verify_message_integrity_in_message(&msg.raw, mi_offset, pwd.as_bytes())
        }) {
            if let Some(prev) = self.previous.take() {
                listener.on_old_ufrag_released(prev.local_ufrag);
            }
            return Ok(());
        }
        if let Some(prev) = &self.previous {
            let prev_password = prev.local_password.clone();
            if local_ufrag == &prev.local_ufrag
                && crypto::verify_message_integrity_in_message(&msg.raw, mi_offset, prev_password.as_bytes())
            {
                return Ok(());
            }
        }
        Err(AuthFailure::UnknownUfrag)
    }

    /// Processes one incoming STUN Binding Request/Indication observed on
    /// `tuple`. Returns the response bytes to send back, if any (requests
    /// get a response; indications and consent responses do not).
    pub fn process_stun_packet(
        &mut self,
        data: &[u8],
        tuple: TransportTuple,
        now_ms: MonoMs,
        listener: &mut impl IceServerListener,
    ) -> Result<Option<bytes::Bytes>, RtcCoreError> {
        let msg = crate::stun::parse(data)?;

        match msg.class {
            Class::SuccessResponse => {
                self.handle_consent_response(&msg, now_ms);
                return Ok(None);
            }
            Class::Indication => {
                return Ok(None);
            }
            Class::ErrorResponse => return Ok(None),
            Class::Request => {}
        }

        if let Some(priority) = msg.attributes.priority {
            let _ = priority;
        } else {
            return Ok(Some(self.build_error_response(&msg, 400)));
        }

        if msg.attributes.ice_controlled.is_some() {
            return Ok(Some(self.build_error_response(&msg, 487)));
        }

        match self.authenticate(&msg, listener) {
            Ok(()) => {}
            Err(AuthFailure::MissingUsername) => {
                return Ok(Some(self.build_error_response(&msg, 400)))
            }
            Err(_) => return Ok(Some(self.build_error_response(&msg, 401))),
        }

        self.handle_tuple(tuple, &msg.attributes, now_ms, listener);

        Ok(Some(self.build_success_response(&msg, tuple)))
    }

    fn handle_tuple(
        &mut self,
        tuple: TransportTuple,
        attrs: &Attributes,
        now_ms: MonoMs,
        listener: &mut impl IceServerListener,
    ) {
        let already_known = self.tuples.contains(&tuple);
        if !already_known {
            if self.tuples.len() >= MAX_TUPLES {
                if let Some(pos) = self.tuples.iter().position(|t| Some(*t) != self.selected) {
                    self.tuples.remove(pos);
                }
            }
            self.tuples.push_back(tuple);
            listener.on_tuple_added(tuple);
        }

        let nomination = attrs.nomination.unwrap_or(0);
        let is_nominating = attrs.use_candidate || attrs.nomination.is_some();
        let nominated_higher = is_nominating && nomination >= self.remote_nomination;

        let should_select = match self.state {
            IceState::New => true,
            IceState::Disconnected => true,
            IceState::Connected => nominated_higher,
            IceState::Completed => nominated_higher,
        };

        if should_select {
            if is_nominating {
                self.remote_nomination = self.remote_nomination.max(nomination);
            }
            self.selected = Some(tuple);
        }

        let new_state = match self.state {
            IceState::New | IceState::Disconnected => {
                if attrs.use_candidate || attrs.nomination.is_some() {
                    IceState::Completed
                } else {
                    IceState::Connected
                }
            }
            IceState::Connected => {
                if is_nominating {
                    IceState::Completed
                } else {
                    IceState::Connected
                }
            }
            IceState::Completed => IceState::Completed,
        };

        if new_state != self.state {
            self.state = new_state;
            listener.on_state_changed(self.state);
            if self.consent_timeout_enabled && matches!(self.state, IceState::Connected | IceState::Completed) {
                self.consent_timer.start_at(now_ms, jittered_consent_period_ms(), false);
            }
        }
    }

    /// Removes `tuple` from the known set, e.g. when the transport layer
    /// reports it closed. Demotes `selected`/transitions to disconnected
    /// per the state table in `spec.md` §4.F.
    pub fn remove_tuple(&mut self, tuple: TransportTuple, listener: &mut impl IceServerListener) {
        self.tuples.retain(|t| *t != tuple);
        if self.selected == Some(tuple) {
            self.selected = self.tuples.front().copied();
            if self.selected.is_none() && matches!(self.state, IceState::Connected | IceState::Completed) {
                self.state = IceState::Disconnected;
                self.consent_timer.stop();
                listener.on_state_changed(self.state);
            }
        }
    }

    fn build_success_response(&self, req: &StunMessage, tuple: TransportTuple) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        message::write_header(&mut buf, Class::SuccessResponse, &req.transaction_id);
        let xor_addr = message::xor_mapped_address_value(tuple.remote, &req.transaction_id);
        message::put_attr(&mut buf, message::ATTR_XOR_MAPPED_ADDRESS, &xor_addr);
        crypto::append_message_integrity(&mut buf, self.current.local_password.as_bytes());
        crypto::append_fingerprint(&mut buf);
        buf.freeze()
    }

    fn build_error_response(&self, req: &StunMessage, code: u16) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        message::write_header(&mut buf, Class::ErrorResponse, &req.transaction_id);
        let class = (code / 100) as u8;
        let number = (code % 100) as u8;
        let mut body = vec![0u8, 0u8, class, number];
        let reason = match code {
            400 => "Bad Request",
            401 => "Unauthorized",
            487 => "Role Conflict",
            _ => "Error",
        };
        body.extend_from_slice(reason.as_bytes());
        message::put_attr(&mut buf, message::ATTR_ERROR_CODE, &body);
        crypto::append_fingerprint(&mut buf);
        buf.freeze()
    }

    /// Called from the event loop tick; emits consent Binding Requests due
    /// to fire and evaluates the 30s timeout.
    pub fn poll_consent(
        &mut self,
        now_ms: MonoMs,
        socket: &mut impl crate::timer::Socket,
        listener: &mut impl IceServerListener,
    ) {
        if !self.consent_timer.poll(now_ms) {
            return;
        }
        self.consent_timer.start_at(now_ms, jittered_consent_period_ms(), false);
        let Some(selected) = self.selected else { return };

        self.outstanding_consent
            .retain(|c| now_ms.0.saturating_sub(c.sent_at_ms.0) < CONSENT_TIMEOUT_MS);
        if self
            .outstanding_consent
            .iter()
            .any(|c| now_ms.0.saturating_sub(c.sent_at_ms.0) >= CONSENT_TIMEOUT_MS)
        {
            self.tuples.clear();
            self.selected = None;
            self.state = IceState::Disconnected;
            self.consent_timer.stop();
            listener.on_state_changed(self.state);
            return;
        }

        let tag = self.next_consent_tag.to_be_bytes();
        self.next_consent_tag += 1;
        let mut tx = [0u8; 12];
        tx[0..4].copy_from_slice(&tag);
        self.outstanding_consent.push(OutstandingConsent {
            tag,
            sent_at_ms: now_ms,
        });

        let mut buf = BytesMut::new();
        message::write_header(&mut buf, Class::Request, &tx);
        crypto::append_message_integrity(&mut buf, self.current.local_password.as_bytes());
        crypto::append_fingerprint(&mut buf);
        socket.send_udp(&buf, selected.remote);
    }

    fn handle_consent_response(&mut self, msg: &StunMessage, now_ms: MonoMs) {
        let tag: [u8; 4] = msg.transaction_id[0..4].try_into().unwrap();
        self.outstanding_consent.retain(|c| c.tag != tag);
        let _ = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        tuples_added: Vec<TransportTuple>,
        states: Vec<IceState>,
    }
    impl IceServerListener for Recorder {
        fn on_tuple_added(&mut self, tuple: TransportTuple) {
            self.tuples_added.push(tuple);
        }
        fn on_state_changed(&mut self, state: IceState) {
            self.states.push(state);
        }
        fn on_old_ufrag_released(&mut self, _old_ufrag: String) {}
    }

    fn creds() -> Credentials {
        Credentials {
            local_ufrag: "lfrag".to_string(),
            local_password: "lpwd".to_string(),
        }
    }

    fn build_request(tx: [u8; 12], username: &str, priority: u32, use_candidate: bool, password: &str) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        message::write_header(&mut buf, Class::Request, &tx);
        message::put_attr(&mut buf, message::ATTR_USERNAME, username.as_bytes());
        message::put_attr(&mut buf, 0x0024, &priority.to_be_bytes());
        if use_candidate {
            message::put_attr(&mut buf, 0x0025, &[]);
        }
        crypto::append_message_integrity(&mut buf, password.as_bytes());
        crypto::append_fingerprint(&mut buf);
        buf.freeze()
    }

    fn tuple(port: u16) -> TransportTuple {
        crate::transport::TransportTuple::new(
            "127.0.0.1:9".parse().unwrap(),
            format!("127.0.0.1:{port}").parse().unwrap(),
            crate::transport::Protocol::Udp,
        )
    }

    #[test]
    fn new_request_without_use_candidate_connects() {
        let mut ice = IceServer::new(creds(), false);
        let mut rec = Recorder::default();
        let req = build_request([1; 12], "lfrag:rfrag", 100, false, "lpwd");
        let resp = ice
            .process_stun_packet(&req, tuple(1), MonoMs(0), &mut rec)
            .unwrap();
        assert!(resp.is_some());
        assert_eq!(ice.state(), IceState::Connected);
        assert_eq!(rec.states, vec![IceState::Connected]);
        assert_eq!(ice.selected_tuple(), Some(tuple(1)));
    }

    #[test]
    fn use_candidate_completes_directly() {
        let mut ice = IceServer::new(creds(), false);
        let mut rec = Recorder::default();
        let req = build_request([2; 12], "lfrag:rfrag", 100, true, "lpwd");
        ice.process_stun_packet(&req, tuple(1), MonoMs(0), &mut rec).unwrap();
        assert_eq!(ice.state(), IceState::Completed);
    }

    #[test]
    fn idempotent_on_repeated_request() {
        let mut ice = IceServer::new(creds(), false);
        let mut rec = Recorder::default();
        let req = build_request([3; 12], "lfrag:rfrag", 100, true, "lpwd");
        ice.process_stun_packet(&req, tuple(1), MonoMs(0), &mut rec).unwrap();
        let state_after_first = ice.state();
        let tuples_after_first = ice.tuples.len();
        ice.process_stun_packet(&req, tuple(1), MonoMs(10), &mut rec).unwrap();
        assert_eq!(ice.state(), state_after_first);
        assert_eq!(ice.tuples.len(), tuples_after_first);
    }

    #[test]
    fn missing_priority_is_bad_request() {
        let mut ice = IceServer::new(creds(), false);
        let mut rec = Recorder::default();
        let mut buf = BytesMut::new();
        message::write_header(&mut buf, Class::Request, &[4; 12]);
        message::put_attr(&mut buf, message::ATTR_USERNAME, b"lfrag:rfrag");
        crypto::append_message_integrity(&mut buf, b"lpwd");
        crypto::append_fingerprint(&mut buf);
        let resp = ice
            .process_stun_packet(&buf, tuple(1), MonoMs(0), &mut rec)
            .unwrap()
            .unwrap();
        let parsed = crate::stun::parse(&resp).unwrap();
        assert_eq!(parsed.attributes.error_code, Some((4, 0)));
    }

    #[test]
    fn consent_period_jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let period = jittered_consent_period_ms();
            assert!(period >= (CONSENT_PERIOD_MS as f64 * 0.8).round() as u64);
            assert!(period <= (CONSENT_PERIOD_MS as f64 * 1.2).round() as u64);
        }
    }

    #[derive(Default)]
    struct FakeSocket {
        sent: Vec<Vec<u8>>,
    }
    impl crate::timer::Socket for FakeSocket {
        fn send_udp(&mut self, bytes: &[u8], _addr: std::net::SocketAddr) -> crate::timer::SendResult {
            self.sent.push(bytes.to_vec());
            crate::timer::SendResult { success: true }
        }
        fn write_tcp(&mut self, _bytes: &[u8]) -> crate::timer::SendResult {
            crate::timer::SendResult { success: true }
        }
    }

    #[test]
    fn consent_timer_rearms_itself_after_firing() {
        let mut ice = IceServer::new(creds(), true);
        let mut rec = Recorder::default();
        let req = build_request([6; 12], "lfrag:rfrag", 100, false, "lpwd");
        ice.process_stun_packet(&req, tuple(1), MonoMs(0), &mut rec).unwrap();
        assert!(ice.consent_timer.is_running());

        let mut socket = FakeSocket::default();
        // The period is jittered up to +20%, so 6_000ms always covers it.
        ice.poll_consent(MonoMs(6_000), &mut socket, &mut rec);
        assert_eq!(socket.sent.len(), 1);
        assert!(ice.consent_timer.is_running());
    }

    #[test]
    fn bad_password_is_unauthorized() {
        let mut ice = IceServer::new(creds(), false);
        let mut rec = Recorder::default();
        let req = build_request([5; 12], "lfrag:rfrag", 100, false, "wrong-password");
        let resp = ice
            .process_stun_packet(&req, tuple(1), MonoMs(0), &mut rec)
            .unwrap()
            .unwrap();
        let parsed = crate::stun::parse(&resp).unwrap();
        assert_eq!(parsed.attributes.error_code, Some((4, 1)));
    }
}
