//! The transcription seam.
//!
//! [`SpeechEngine`] is the interface the inference worker drives. The
//! production implementation wraps one `whisper_rs::WhisperState`; a state
//! is non-reentrant, so each engine instance must only ever have one caller
//! at a time — the [`ContextPool`](crate::engine::pool::ContextPool)
//! enforces that by moving ownership into the lease.

use std::sync::Arc;

use thiserror::Error;
use whisper_rs::{FullParams, SamplingStrategy, WhisperState};

/// A single inference call failed. Logged by the worker, never fatal.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Partial runs trade coherence for latency: one forced segment, no
/// cross-call context, no timestamps. Final runs let the model segment
/// the utterance naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscribeMode {
    Partial,
    Final,
}

/// Decode settings shared by every context slot.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub language: String,
    pub n_threads: i32,
    pub translate: bool,
}

pub trait SpeechEngine: Send {
    /// Transcribe 16 kHz mono f32 samples and return the concatenated
    /// segment text, trimmed of leading/trailing ASCII whitespace.
    fn transcribe(&mut self, samples: &[f32], mode: TranscribeMode) -> Result<String, EngineError>;
}

pub struct WhisperSpeechEngine {
    state: WhisperState,
    opts: Arc<DecodeOptions>,
}

impl WhisperSpeechEngine {
    pub fn new(state: WhisperState, opts: Arc<DecodeOptions>) -> Self {
        Self { state, opts }
    }
}

fn build_full_params(opts: &DecodeOptions, mode: TranscribeMode) -> FullParams<'_, '_> {
    let mut fp = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    fp.set_language(Some(opts.language.as_str()));
    fp.set_n_threads(opts.n_threads);
    fp.set_translate(opts.translate);
    fp.set_print_special(false);
    fp.set_print_progress(false);
    fp.set_print_realtime(false);
    fp.set_print_timestamps(false);
    match mode {
        TranscribeMode::Partial => {
            fp.set_single_segment(true);
            fp.set_max_tokens(0);
            fp.set_no_context(true);
            fp.set_no_timestamps(true);
        }
        TranscribeMode::Final => {
            fp.set_single_segment(false);
        }
    }
    fp
}

impl SpeechEngine for WhisperSpeechEngine {
    fn transcribe(&mut self, samples: &[f32], mode: TranscribeMode) -> Result<String, EngineError> {
        let fp = build_full_params(&self.opts, mode);
        self.state
            .full(fp, samples)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let n_segments = self
            .state
            .full_n_segments()
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let mut text = String::new();
        for i in 0..n_segments {
            let seg = self
                .state
                .full_get_segment_text(i)
                .map_err(|e| EngineError::Inference(format!("segment {i}: {e}")))?;
            text.push_str(&seg);
        }

        Ok(trim_ascii_whitespace(&text).to_owned())
    }
}

/// Trim exactly ` \t\n\r` (not the full Unicode whitespace set).
pub(crate) fn trim_ascii_whitespace(text: &str) -> &str {
    text.trim_matches([' ', '\t', '\n', '\r'])
}

// ---------------------------------------------------------------------------
// MockEngine  (test-only)
// ---------------------------------------------------------------------------

/// Scripted engine for driving the worker without a model file. Pops one
/// response per call; an exhausted script returns empty text.
#[cfg(test)]
pub struct MockEngine {
    script: std::sync::Mutex<std::collections::VecDeque<Result<String, EngineError>>>,
    pub calls: std::sync::Mutex<Vec<(usize, TranscribeMode)>>,
}

#[cfg(test)]
impl MockEngine {
    pub fn with_responses<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, EngineError>>,
    {
        Self {
            script: std::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self::with_responses([])
    }
}

#[cfg(test)]
impl SpeechEngine for MockEngine {
    fn transcribe(&mut self, samples: &[f32], mode: TranscribeMode) -> Result<String, EngineError> {
        self.calls.lock().unwrap().push((samples.len(), mode));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_strips_ascii_whitespace_only() {
        assert_eq!(trim_ascii_whitespace(" \t hello world \n\r"), "hello world");
        assert_eq!(trim_ascii_whitespace("   "), "");
        // Unicode whitespace is preserved; whisper never emits it at the
        // edges, and the wire contract pins the ASCII set.
        assert_eq!(trim_ascii_whitespace("\u{a0}x"), "\u{a0}x");
    }

    #[test]
    fn mock_engine_pops_script_in_order() {
        let mut engine = MockEngine::with_responses([
            Ok("first".to_owned()),
            Err(EngineError::Inference("boom".to_owned())),
        ]);
        assert_eq!(
            engine.transcribe(&[0.0; 10], TranscribeMode::Partial).unwrap(),
            "first"
        );
        assert!(engine.transcribe(&[0.0; 10], TranscribeMode::Final).is_err());
        // Exhausted script yields empty text.
        assert_eq!(
            engine.transcribe(&[0.0; 10], TranscribeMode::Partial).unwrap(),
            ""
        );
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], (10, TranscribeMode::Final));
    }
}
