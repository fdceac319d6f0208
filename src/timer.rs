//! Monotonic timer abstraction (`spec.md` §4.M). The core never calls into
//! an OS timer directly; every timed behaviour (consent checks, NACK time
//! filter, key-frame retry, pacer ticks) goes through this trait so the
//! same component code runs against a real event loop or a test harness
//! that advances a [`crate::clock::ManualClock`] by hand.

use crate::clock::MonoMs;

/// A single-shot or repeating timer. Implementations must make `stop`
/// idempotent and must not invoke a callback after `stop` returns, even if
/// a tick was already in flight (`spec.md` §5 cancellation guarantee).
pub trait Timer {
    fn start(&mut self, timeout_ms: u64, repeat: bool);
    fn stop(&mut self);
    fn reset(&mut self);
    fn restart(&mut self, timeout_ms: u64, repeat: bool) {
        self.stop();
        self.start(timeout_ms, repeat);
    }
}

/// A timer driven purely by an explicit `poll(now_ms)` call rather than a
/// real OS event loop; this is what every component in this crate is built
/// against; a production binary wires it to whatever reactor owns the
/// process (e.g. a `tokio::time::Interval`).
#[derive(Debug, Default)]
pub struct PollTimer {
    timeout_ms: u64,
    repeat: bool,
    due_at: Option<MonoMs>,
    running: bool,
}

impl PollTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` at most once per due tick; repeating timers rearm
    /// themselves for the next period.
    pub fn poll(&mut self, now_ms: MonoMs) -> bool {
        if !self.running {
            return false;
        }
        let Some(due) = self.due_at else { return false };
        if now_ms.0 < due.0 {
            return false;
        }
        if self.repeat {
            self.due_at = Some(now_ms.add_ms(self.timeout_ms));
        } else {
            self.running = false;
            self.due_at = None;
        }
        true
    }

    pub fn start_at(&mut self, now_ms: MonoMs, timeout_ms: u64, repeat: bool) {
        self.timeout_ms = timeout_ms;
        self.repeat = repeat;
        self.due_at = Some(now_ms.add_ms(timeout_ms));
        self.running = true;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Timer for PollTimer {
    fn start(&mut self, timeout_ms: u64, repeat: bool) {
        self.timeout_ms = timeout_ms;
        self.repeat = repeat;
        self.running = true;
        // `due_at` is set relative to the next `poll`'s `now_ms` via
        // `start_at`; callers driving the loop with only a `Timer` handle
        // (no clock reference) are expected to call `start_at` instead.
    }

    fn stop(&mut self) {
        self.running = false;
        self.due_at = None;
    }

    fn reset(&mut self) {
        self.due_at = None;
    }
}

/// Outcome of a completed send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
}

/// The only I/O surface the core touches: UDP datagrams and RFC 4571
/// length-framed TCP. `spec.md` §5/§6.
pub trait Socket {
    fn send_udp(&mut self, bytes: &[u8], addr: std::net::SocketAddr) -> SendResult;
    fn write_tcp(&mut self, bytes: &[u8]) -> SendResult;
}

/// Prepends the 2-byte big-endian length prefix RFC 4571 requires when RTP
/// or RTCP is carried over a TCP transport tuple.
#[must_use]
pub fn frame_for_tcp(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_timer_fires_once() {
        let mut t = PollTimer::new();
        t.start_at(MonoMs(0), 100, false);
        assert!(!t.poll(MonoMs(50)));
        assert!(t.poll(MonoMs(100)));
        assert!(!t.poll(MonoMs(200)));
    }

    #[test]
    fn repeating_timer_rearms() {
        let mut t = PollTimer::new();
        t.start_at(MonoMs(0), 40, true);
        assert!(t.poll(MonoMs(40)));
        assert!(!t.poll(MonoMs(60)));
        assert!(t.poll(MonoMs(80)));
    }

    #[test]
    fn stop_prevents_pending_tick_from_firing() {
        let mut t = PollTimer::new();
        t.start_at(MonoMs(0), 40, false);
        t.stop();
        assert!(!t.poll(MonoMs(40)));
    }

    #[test]
    fn tcp_framing_prepends_length() {
        let framed = frame_for_tcp(&[1, 2, 3]);
        assert_eq!(framed, vec![0, 3, 1, 2, 3]);
    }
}
