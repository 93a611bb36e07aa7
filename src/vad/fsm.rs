//! Per-session speech state machine, driven by VAD probabilities on a
//! ~30 ms cadence.
//!
//! The machine itself is pure: it consumes `(is_speech, now_ms)` pairs and
//! reports what happened as a [`Transition`]. Side effects — leasing a
//! context, clearing buffers, emitting the final — belong to the worker.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    Idle,
    Speaking,
    /// Silence held long enough; the next transcription tick emits the
    /// final and resets to Idle (unless speech resumes first).
    Ending,
}

#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// Silence duration that closes an utterance (Speaking -> Ending).
    pub silence_trigger_ms: i64,
    /// Utterances shorter than this are discarded instead of finalized.
    pub min_speech_ms: i64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            silence_trigger_ms: 1000,
            min_speech_ms: 100,
        }
    }
}

/// What one VAD observation did to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Idle -> Speaking.
    Started,
    /// Speaking -> Ending: the utterance is complete, emit a final.
    Ended,
    /// Speaking -> Idle: too short, drop everything buffered.
    Discarded,
    /// Ending -> Speaking: the speaker resumed before the final went out.
    Resumed,
}

#[derive(Debug, Clone)]
pub struct SpeechTracker {
    pub state: SpeechState,
    pub speech_start_ms: i64,
    pub last_speech_ms: i64,
}

impl Default for SpeechTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechTracker {
    pub fn new() -> Self {
        Self {
            state: SpeechState::Idle,
            speech_start_ms: 0,
            last_speech_ms: 0,
        }
    }

    pub fn advance(&mut self, is_speech: bool, now_ms: i64, cfg: &FsmConfig) -> Transition {
        match self.state {
            SpeechState::Idle => {
                if is_speech {
                    self.state = SpeechState::Speaking;
                    self.speech_start_ms = now_ms;
                    self.last_speech_ms = now_ms;
                    Transition::Started
                } else {
                    Transition::None
                }
            }
            SpeechState::Speaking => {
                if is_speech {
                    self.last_speech_ms = now_ms;
                    return Transition::None;
                }
                let silence_ms = now_ms - self.last_speech_ms;
                if silence_ms < cfg.silence_trigger_ms {
                    return Transition::None;
                }
                if now_ms - self.speech_start_ms >= cfg.min_speech_ms {
                    self.state = SpeechState::Ending;
                    Transition::Ended
                } else {
                    self.state = SpeechState::Idle;
                    Transition::Discarded
                }
            }
            SpeechState::Ending => {
                if is_speech {
                    self.state = SpeechState::Speaking;
                    self.last_speech_ms = now_ms;
                    Transition::Resumed
                } else {
                    Transition::None
                }
            }
        }
    }

    /// Back to Idle after a final (or a teardown). Timing fields are left
    /// alone; Idle ignores them.
    pub fn reset(&mut self) {
        self.state = SpeechState::Idle;
    }
}
