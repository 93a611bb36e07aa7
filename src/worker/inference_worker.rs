//! The background inference worker.
//!
//! One dedicated thread drives every session's state machine on two
//! cadences: VAD every ~30 ms, transcription every ~500 ms. Inference is
//! blocking and runs right here — never on the I/O runtime. Results go
//! out through each session's outbound queue plus a debounced wakeup of
//! its writer task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::ring::SAMPLE_RATE;
use crate::engine::pool::ContextPool;
use crate::engine::speech::TranscribeMode;
use crate::server::messages;
use crate::session::registry::SessionRegistry;
use crate::session::session::{Session, UtteranceState};
use crate::vad::engine::VoiceDetector;
use crate::vad::fsm::{FsmConfig, SpeechState, Transition};

/// `pcm_old` is capped at 30 s so an unbroken monologue degrades to a
/// sliding window instead of an unbounded allocation.
const MAX_UTTERANCE_SAMPLES: usize = 30 * SAMPLE_RATE;

/// Sleep between scheduler checks.
const TICK_QUANTUM: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Transcription cadence.
    pub step_ms: u64,
    /// Sliding-window target length for partials.
    pub length_ms: u64,
    /// Overlap carried from the previous window.
    pub keep_ms: u64,
    /// VAD cadence; also the tail length fed to the detector.
    pub vad_check_ms: u64,
    /// `p > threshold` counts as speech.
    pub vad_threshold: f32,
    pub fsm: FsmConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            step_ms: 500,
            length_ms: 5000,
            keep_ms: 200,
            vad_check_ms: 30,
            vad_threshold: 0.5,
            fsm: FsmConfig::default(),
        }
    }
}

pub struct InferenceWorker {
    registry: Arc<SessionRegistry>,
    pool: Arc<ContextPool>,
    vad: Option<Arc<dyn VoiceDetector>>,
    cfg: WorkerConfig,
    running: Arc<AtomicBool>,
}

impl InferenceWorker {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pool: Arc<ContextPool>,
        vad: Option<Arc<dyn VoiceDetector>>,
        cfg: WorkerConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            pool,
            vad,
            cfg,
            running,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(self) {
        let epoch = Instant::now();
        let vad_interval = Duration::from_millis(self.cfg.vad_check_ms);
        let step_interval = Duration::from_millis(self.cfg.step_ms);
        let mut last_vad = epoch;
        let mut last_step = epoch;

        tracing::info!(
            step_ms = self.cfg.step_ms,
            length_ms = self.cfg.length_ms,
            keep_ms = self.cfg.keep_ms,
            vad = self.vad.is_some(),
            "inference worker running"
        );

        while self.running.load(Ordering::Acquire) {
            let now_ms = epoch.elapsed().as_millis() as i64;
            let sessions = self.registry.snapshot_active();

            if self.vad.is_some() && last_vad.elapsed() >= vad_interval {
                self.vad_pass(&sessions, now_ms);
                last_vad = Instant::now();
            }

            if last_step.elapsed() >= step_interval {
                self.transcription_pass(&sessions);
                last_step = Instant::now();
            }

            if self.any_waiting_for_slot(&sessions) {
                // Nap on the pool so a context freed by a disconnect is
                // picked up before the next full quantum.
                self.pool.wait_for_release(TICK_QUANTUM);
            } else {
                thread::sleep(TICK_QUANTUM);
            }
        }

        tracing::info!("inference worker stopped");
    }

    fn any_waiting_for_slot(&self, sessions: &[Arc<Session>]) -> bool {
        sessions.iter().any(|s| {
            let ut = s.utterance.lock().expect("utterance lock poisoned");
            ut.tracker.state == SpeechState::Speaking && ut.slot.is_none()
        })
    }

    /// Score the tail of each session's ring and advance its state
    /// machine. Only runs when a VAD model is configured.
    fn vad_pass(&self, sessions: &[Arc<Session>], now_ms: i64) {
        let Some(vad) = self.vad.as_deref() else {
            return;
        };

        for session in sessions {
            let tail = session.audio.snapshot_tail_ms(self.cfg.vad_check_ms as usize);
            if tail.is_empty() {
                continue;
            }
            let p = vad.speech_probability(&tail);
            let is_speech = p > self.cfg.vad_threshold;

            let mut ut = session.utterance.lock().expect("utterance lock poisoned");
            match ut.tracker.advance(is_speech, now_ms, &self.cfg.fsm) {
                Transition::Started => {
                    ut.pending_text.clear();
                    if ut.slot.is_none() {
                        ut.slot = self.pool.try_lease();
                    }
                    if ut.slot.is_none() {
                        tracing::debug!(
                            session = %session.id,
                            "speech started with all contexts busy, partials delayed"
                        );
                    }
                    tracing::info!(session = %session.id, "speech started");
                }
                Transition::Ended => {
                    tracing::info!(
                        session = %session.id,
                        duration_ms = now_ms - ut.tracker.speech_start_ms,
                        "speech ended"
                    );
                }
                Transition::Discarded => {
                    tracing::info!(
                        session = %session.id,
                        duration_ms = now_ms - ut.tracker.speech_start_ms,
                        "discarded short utterance"
                    );
                    self.discard_utterance(session, &mut ut);
                }
                Transition::Resumed => {
                    tracing::debug!(session = %session.id, "speech resumed before final");
                }
                Transition::None => {}
            }
        }
    }

    fn transcription_pass(&self, sessions: &[Arc<Session>]) {
        for session in sessions {
            if self.vad.is_some() {
                self.tick_with_vad(session);
            } else {
                self.tick_without_vad(session);
            }
        }
    }

    fn tick_with_vad(&self, session: &Session) {
        let mut ut = session.utterance.lock().expect("utterance lock poisoned");
        match ut.tracker.state {
            SpeechState::Idle => {}
            SpeechState::Speaking => {
                if ut.slot.is_none() {
                    ut.slot = self.pool.try_lease();
                }
                // Still nothing free: keep buffering, retry next tick.
                if ut.slot.is_some() {
                    self.run_partial(session, &mut ut);
                }
            }
            SpeechState::Ending => self.run_final(session, &mut ut),
        }
    }

    /// Without VAD there are no utterance boundaries: partials run for any
    /// session with at least one step of buffered audio, and finals never.
    fn tick_without_vad(&self, session: &Session) {
        if !session.audio.has_min_duration(self.cfg.step_ms as usize) {
            return;
        }
        let mut ut = session.utterance.lock().expect("utterance lock poisoned");
        if ut.slot.is_none() {
            ut.slot = self.pool.try_lease();
        }
        if ut.slot.is_some() {
            self.run_partial(session, &mut ut);
        }
    }

    fn discard_utterance(&self, session: &Session, ut: &mut UtteranceState) {
        if let Some(slot) = ut.slot.take() {
            self.pool.release(slot);
        }
        ut.pcm_old.clear();
        ut.pending_text.clear();
        session.audio.clear();
    }

    /// Sliding-window partial inference. Precondition: a slot is held.
    fn run_partial(&self, session: &Session, ut: &mut UtteranceState) {
        if session.inference_running.swap(true, Ordering::AcqRel) {
            return;
        }
        if !session.is_active() {
            session.inference_running.store(false, Ordering::Release);
            return;
        }

        let new_audio = session.audio.take_all_clear();
        if new_audio.is_empty() {
            session.inference_running.store(false, Ordering::Release);
            return;
        }

        let n_keep = self.cfg.keep_ms as usize * SAMPLE_RATE / 1000;
        let n_length = self.cfg.length_ms as usize * SAMPLE_RATE / 1000;

        let UtteranceState {
            pcm_old,
            last_text,
            pending_text,
            slot,
            ..
        } = ut;

        // Window = tail of the previous window + everything new, aiming
        // for keep+length total once the utterance is long enough.
        let keep = pcm_old
            .len()
            .min((n_keep + n_length).saturating_sub(new_audio.len()));
        let mut window = Vec::with_capacity(keep + new_audio.len());
        window.extend_from_slice(&pcm_old[pcm_old.len() - keep..]);
        window.extend_from_slice(&new_audio);
        if window.len() > MAX_UTTERANCE_SAMPLES {
            let excess = window.len() - MAX_UTTERANCE_SAMPLES;
            window.drain(..excess);
        }
        *pcm_old = window;

        let Some(slot) = slot.as_mut() else {
            session.inference_running.store(false, Ordering::Release);
            return;
        };

        match slot.engine_mut().transcribe(pcm_old, TranscribeMode::Partial) {
            Ok(text) => {
                if !text.is_empty() && text != *last_text {
                    session.enqueue(messages::partial_message(&text));
                    session.notify_flush();
                    *pending_text = text.clone();
                    *last_text = text;
                }
            }
            Err(e) => {
                // Slot stays leased and the state stays Speaking; the next
                // tick retries with more audio.
                tracing::warn!(session = %session.id, error = %e, "partial inference failed");
            }
        }

        session.inference_running.store(false, Ordering::Release);
    }

    /// End-of-utterance inference over the accumulated audio, then an
    /// unconditional reset to Idle.
    fn run_final(&self, session: &Session, ut: &mut UtteranceState) {
        if session.inference_running.swap(true, Ordering::AcqRel) {
            return;
        }

        if session.is_active() {
            if ut.slot.is_none() {
                // The whole utterance may have run with every context busy;
                // one last attempt before giving up on the final.
                ut.slot = self.pool.try_lease();
            }

            let UtteranceState { pcm_old, slot, .. } = &mut *ut;
            if pcm_old.is_empty() {
                tracing::debug!(session = %session.id, "utterance ended with no audio");
            } else if let Some(slot) = slot.as_mut() {
                match slot.engine_mut().transcribe(pcm_old, TranscribeMode::Final) {
                    Ok(text) if !text.is_empty() => {
                        tracing::info!(session = %session.id, text = %text, "final transcript");
                        session.enqueue(messages::final_message(&text));
                        session.notify_flush();
                    }
                    Ok(_) => {
                        tracing::debug!(session = %session.id, "final inference returned empty text");
                    }
                    Err(e) => {
                        tracing::warn!(session = %session.id, error = %e, "final inference failed");
                    }
                }
            } else {
                tracing::debug!(session = %session.id, "no context for final, dropping utterance");
            }
        }

        ut.tracker.reset();
        ut.pending_text.clear();
        ut.pcm_old.clear();
        ut.last_text.clear();
        session.audio.clear();
        if let Some(slot) = ut.slot.take() {
            self.pool.release(slot);
        }
        session.inference_running.store(false, Ordering::Release);
    }
}
