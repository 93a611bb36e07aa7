//! Per-connection state, shared between the I/O tasks and the inference
//! worker via `Arc`.
//!
//! Field ownership is strict: the reader task only pushes audio, the
//! worker owns everything inside [`UtteranceState`], and the writer task
//! owns the socket sink. The outbound queue plus the debounced flush flag
//! are the only crossing point.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;

use crate::audio::ring::{AudioRing, SAMPLE_RATE};
use crate::engine::pool::SlotHandle;
use crate::vad::fsm::SpeechTracker;

/// Cap the per-session ring at 30 s of audio.
const MAX_BUFFER_SECONDS: f32 = 30.0;

/// Wakes the connection's writer task; one signal per flush burst.
pub type FlushSender = UnboundedSender<()>;

/// Worker-owned utterance state. Grouped under one mutex; the lock is
/// uncontended in steady state because only the worker takes it, with the
/// teardown path joining in after inference has drained.
pub struct UtteranceState {
    pub tracker: SpeechTracker,
    /// Accumulated utterance audio, carried across partial windows.
    pub pcm_old: Vec<f32>,
    /// Last emitted partial; dedup key.
    pub last_text: String,
    /// Last partial, candidate for the final if VAD closes the utterance.
    pub pending_text: String,
    /// Leased inference context; present only while the utterance needs one.
    pub slot: Option<SlotHandle>,
}

pub struct Session {
    pub id: String,
    pub audio: AudioRing,
    active: AtomicBool,
    pub inference_running: AtomicBool,
    flush_scheduled: AtomicBool,
    outbound: Mutex<VecDeque<String>>,
    io: Mutex<Option<FlushSender>>,
    pub utterance: Mutex<UtteranceState>,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            audio: AudioRing::new(MAX_BUFFER_SECONDS, SAMPLE_RATE),
            active: AtomicBool::new(true),
            inference_running: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            io: Mutex::new(None),
            utterance: Mutex::new(UtteranceState {
                tracker: SpeechTracker::new(),
                pcm_old: Vec::new(),
                last_text: String::new(),
                pending_text: String::new(),
                slot: None,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks teardown; the worker's next snapshot excludes this session.
    pub fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    // --- outbound queue -----------------------------------------------------

    pub fn enqueue(&self, msg: String) {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .push_back(msg);
    }

    /// Returns all pending messages, in enqueue order, and clears the
    /// queue. A second call with no intervening enqueue returns empty.
    pub fn drain_outbound(&self) -> Vec<String> {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.lock().expect("outbound lock poisoned").is_empty()
    }

    // --- flush scheduling ---------------------------------------------------

    /// Debounced wakeup for the writer task. The first notify of a burst
    /// flips `flush_scheduled` and posts one signal; later notifies are
    /// no-ops until the writer re-arms via [`begin_flush`](Self::begin_flush).
    /// With no writer attached, queued messages are dropped on the floor.
    pub fn notify_flush(&self) {
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let io = self.io.lock().expect("io lock poisoned");
        let delivered = match io.as_ref() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };
        if !delivered {
            // Writer gone: nothing will ever drain this queue.
            self.flush_scheduled.store(false, Ordering::Release);
            drop(io);
            self.drain_outbound();
        }
    }

    /// Called by the writer before draining, so a notify arriving during
    /// the drain re-arms another flush instead of being coalesced away.
    pub fn begin_flush(&self) {
        self.flush_scheduled.store(false, Ordering::Release);
    }

    pub fn attach(&self, tx: FlushSender) {
        *self.io.lock().expect("io lock poisoned") = Some(tx);
    }

    /// Reactor-side on close: drop the write handle and disarm the flush
    /// debounce. Anything still queued is discarded at the next notify.
    pub fn detach(&self) {
        *self.io.lock().expect("io lock poisoned") = None;
        self.flush_scheduled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn drain_preserves_enqueue_order_and_is_idempotent() {
        let session = Session::new("s".into());
        session.enqueue("a".into());
        session.enqueue("b".into());
        session.enqueue("c".into());

        assert_eq!(session.drain_outbound(), vec!["a", "b", "c"]);
        assert!(session.drain_outbound().is_empty());
    }

    #[test]
    fn notify_is_debounced_until_begin_flush() {
        let session = Session::new("s".into());
        let (tx, mut rx) = unbounded_channel();
        session.attach(tx);

        session.enqueue("a".into());
        session.notify_flush();
        session.notify_flush();
        session.notify_flush();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "burst must coalesce to one signal");

        // Writer re-arms, next notify posts again.
        session.begin_flush();
        session.notify_flush();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn notify_after_detach_drops_messages() {
        let session = Session::new("s".into());
        let (tx, _rx) = unbounded_channel();
        session.attach(tx);
        session.detach();

        session.enqueue("lost".into());
        session.notify_flush();

        assert!(!session.has_outbound());
        // The debounce flag was not left armed.
        session.enqueue("again".into());
        session.notify_flush();
        assert!(!session.has_outbound());
    }

    #[test]
    fn notify_with_closed_writer_drops_messages() {
        let session = Session::new("s".into());
        let (tx, rx) = unbounded_channel();
        session.attach(tx);
        drop(rx);

        session.enqueue("lost".into());
        session.notify_flush();
        assert!(!session.has_outbound());
    }

    #[test]
    fn new_session_is_active_and_idle() {
        let session = Session::new("s".into());
        assert!(session.is_active());
        assert!(!session.inference_running.load(Ordering::Acquire));
        let ut = session.utterance.lock().unwrap();
        assert!(ut.slot.is_none());
        assert!(ut.pcm_old.is_empty());
        session.set_inactive();
        assert!(!session.is_active());
    }
}
