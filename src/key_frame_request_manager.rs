//! Throttled PLI/FIR scheduling with re-ask-on-timeout semantics
//! (`spec.md` §4.E).

use std::collections::HashMap;

use crate::clock::MonoMs;

const PENDING_KEY_FRAME_TIMEOUT_MS: u64 = 1_000;

/// Receives the actual PLI/FIR send request; implemented by the transport
/// glue that owns the RTCP writer for a given producer.
pub trait KeyFrameListener {
    fn request_key_frame(&mut self, ssrc: u32);
}

struct PendingKeyFrameInfo {
    due_ms: MonoMs,
    retry_on_timeout: bool,
}

struct KeyFrameRequestDelayer {
    due_ms: MonoMs,
    pending: bool,
}

#[derive(Default)]
struct PerSsrc {
    pending: Option<PendingKeyFrameInfo>,
    delayer: Option<KeyFrameRequestDelayer>,
}

pub struct KeyFrameRequestManager {
    delay_ms: u64,
    per_ssrc: HashMap<u32, PerSsrc>,
}

impl KeyFrameRequestManager {
    /// `delay_ms = 0` disables the request delayer entirely: every
    /// `key_frame_needed` call either fires immediately or arms a retry on
    /// the existing pending request.
    #[must_use]
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            per_ssrc: HashMap::new(),
        }
    }

    fn entry(&mut self, ssrc: u32) -> &mut PerSsrc {
        self.per_ssrc.entry(ssrc).or_default()
    }

    pub fn key_frame_needed(
        &mut self,
        ssrc: u32,
        now_ms: MonoMs,
        listener: &mut impl KeyFrameListener,
    ) {
        let had_delayer = self.entry(ssrc).delayer.is_some();
        if had_delayer {
            self.entry(ssrc).delayer.as_mut().unwrap().pending = true;
            return;
        }
        if self.delay_ms > 0 {
            self.entry(ssrc).delayer = Some(KeyFrameRequestDelayer {
                due_ms: now_ms.add_ms(self.delay_ms),
                pending: false,
            });
        }

        let has_pending = self.entry(ssrc).pending.is_some();
        if has_pending {
            let pending = self.entry(ssrc).pending.as_mut().unwrap();
            pending.retry_on_timeout = true;
        } else {
            self.entry(ssrc).pending = Some(PendingKeyFrameInfo {
                due_ms: now_ms.add_ms(PENDING_KEY_FRAME_TIMEOUT_MS),
                retry_on_timeout: false,
            });
            listener.request_key_frame(ssrc);
        }
    }

    pub fn force_key_frame_needed(
        &mut self,
        ssrc: u32,
        now_ms: MonoMs,
        listener: &mut impl KeyFrameListener,
    ) {
        if let Some(delayer) = self.entry(ssrc).delayer.as_mut() {
            delayer.pending = false;
            delayer.due_ms = now_ms.add_ms(self.delay_ms);
        }
        self.entry(ssrc).pending = Some(PendingKeyFrameInfo {
            due_ms: now_ms.add_ms(PENDING_KEY_FRAME_TIMEOUT_MS),
            retry_on_timeout: false,
        });
        listener.request_key_frame(ssrc);
    }

    pub fn key_frame_received(&mut self, ssrc: u32) {
        if let Some(state) = self.per_ssrc.get_mut(&ssrc) {
            state.pending = None;
        }
    }

    /// Drives both the per-ssrc pending-info timer and the request delayer.
    /// Call regularly from the event loop tick.
    pub fn poll(&mut self, now_ms: MonoMs, listener: &mut impl KeyFrameListener) {
        let ssrcs: Vec<u32> = self.per_ssrc.keys().copied().collect();
        for ssrc in ssrcs {
            self.poll_pending(ssrc, now_ms, listener);
            self.poll_delayer(ssrc, now_ms, listener);
        }
    }

    fn poll_pending(&mut self, ssrc: u32, now_ms: MonoMs, listener: &mut impl KeyFrameListener) {
        let Some(state) = self.per_ssrc.get_mut(&ssrc) else {
            return;
        };
        let Some(pending) = &state.pending else {
            return;
        };
        if now_ms.0 < pending.due_ms.0 {
            return;
        }
        if pending.retry_on_timeout {
            listener.request_key_frame(ssrc);
            if let Some(p) = state.pending.as_mut() {
                p.retry_on_timeout = false;
                p.due_ms = now_ms.add_ms(PENDING_KEY_FRAME_TIMEOUT_MS);
            }
        } else {
            state.pending = None;
        }
    }

    fn poll_delayer(&mut self, ssrc: u32, now_ms: MonoMs, listener: &mut impl KeyFrameListener) {
        let Some(state) = self.per_ssrc.get_mut(&ssrc) else {
            return;
        };
        let Some(delayer) = &state.delayer else {
            return;
        };
        if now_ms.0 < delayer.due_ms.0 {
            return;
        }
        let was_pending = delayer.pending;
        state.delayer = None;
        if was_pending {
            self.key_frame_needed(ssrc, now_ms, listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<u32>);
    impl KeyFrameListener for Recorder {
        fn request_key_frame(&mut self, ssrc: u32) {
            self.0.push(ssrc);
        }
    }

    #[test]
    fn first_request_fires_immediately() {
        let mut mgr = KeyFrameRequestManager::new(0);
        let mut rec = Recorder::default();
        mgr.key_frame_needed(1, MonoMs(0), &mut rec);
        assert_eq!(rec.0, vec![1]);
    }

    #[test]
    fn second_request_before_timeout_is_retried_on_next_timeout() {
        let mut mgr = KeyFrameRequestManager::new(0);
        let mut rec = Recorder::default();
        mgr.key_frame_needed(1, MonoMs(0), &mut rec);
        mgr.key_frame_needed(1, MonoMs(100), &mut rec);
        assert_eq!(rec.0, vec![1]); // second call only arms retry, no immediate fire
        mgr.poll(MonoMs(1_000), &mut rec);
        assert_eq!(rec.0, vec![1, 1]);
    }

    #[test]
    fn key_frame_received_clears_pending() {
        let mut mgr = KeyFrameRequestManager::new(0);
        let mut rec = Recorder::default();
        mgr.key_frame_needed(1, MonoMs(0), &mut rec);
        mgr.key_frame_received(1);
        mgr.poll(MonoMs(2_000), &mut rec);
        assert_eq!(rec.0, vec![1]); // no retry fired, pending was cleared
    }

    #[test]
    fn delayer_coalesces_rapid_requests() {
        let mut mgr = KeyFrameRequestManager::new(200);
        let mut rec = Recorder::default();
        mgr.key_frame_needed(1, MonoMs(0), &mut rec);
        mgr.key_frame_needed(1, MonoMs(10), &mut rec);
        mgr.key_frame_needed(1, MonoMs(20), &mut rec);
        assert_eq!(rec.0, vec![1]);
        // Delayer timeout with pending=true re-enters key_frame_needed,
        // which only arms the retry flag since pending info still exists.
        mgr.poll(MonoMs(250), &mut rec);
        assert_eq!(rec.0, vec![1]);
        mgr.poll(MonoMs(1_100), &mut rec);
        assert_eq!(rec.0, vec![1, 1]);
    }
}
