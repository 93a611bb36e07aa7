//! Voice activity detection over whisper.cpp's VAD API.
//!
//! One `whisper_vad_context` is shared by every session. The context is
//! not thread-safe, so every call goes through a single mutex; at a 30 ms
//! cadence over short tails this is never a contention point.

use std::ffi::CString;
use std::os::raw::c_int;
use std::sync::Mutex;

use whisper_rs::whisper_rs_sys;

use crate::error::ServerError;

/// The worker's seam for speech scoring. The production implementation is
/// [`VadEngine`]; tests script their own.
pub trait VoiceDetector: Send + Sync {
    /// Probability that `samples` (typically the last ~30 ms) contain
    /// speech. Returns `0.0` on any internal failure.
    fn speech_probability(&self, samples: &[f32]) -> f32;
}

struct VadCtx(*mut whisper_rs_sys::whisper_vad_context);

// The raw context never leaves the mutex in VadEngine, so exclusive
// access is guaranteed at the type level by the lock.
unsafe impl Send for VadCtx {}

impl Drop for VadCtx {
    fn drop(&mut self) {
        unsafe { whisper_rs_sys::whisper_vad_free(self.0) }
    }
}

pub struct VadEngine {
    ctx: Mutex<VadCtx>,
}

impl VadEngine {
    pub fn load(model_path: &str) -> Result<Self, ServerError> {
        let c_path = CString::new(model_path).map_err(|_| {
            ServerError::ModelLoad(format!("VAD model path contains a NUL byte: {model_path}"))
        })?;

        let ptr = unsafe {
            let mut params = whisper_rs_sys::whisper_vad_default_context_params();
            params.n_threads = 2;
            // The VAD net is tiny; keep it off the GPU.
            params.use_gpu = false;
            whisper_rs_sys::whisper_vad_init_from_file_with_params(c_path.as_ptr(), params)
        };

        if ptr.is_null() {
            return Err(ServerError::ModelLoad(format!(
                "failed to load VAD model: {model_path}"
            )));
        }

        Ok(Self {
            ctx: Mutex::new(VadCtx(ptr)),
        })
    }
}

impl VoiceDetector for VadEngine {
    fn speech_probability(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let guard = self.ctx.lock().expect("vad lock poisoned");
        let ctx = guard.0;

        // Safety: the context pointer is valid for the lifetime of the
        // guard, and the lock serializes all access.
        unsafe {
            if !whisper_rs_sys::whisper_vad_detect_speech(
                ctx,
                samples.as_ptr(),
                samples.len() as c_int,
            ) {
                return 0.0;
            }
            let n_probs = whisper_rs_sys::whisper_vad_n_probs(ctx);
            if n_probs <= 0 {
                return 0.0;
            }
            let probs = whisper_rs_sys::whisper_vad_probs(ctx);
            if probs.is_null() {
                return 0.0;
            }
            // The tail frame is the freshest signal; that is what the
            // state machine keys on.
            *probs.add((n_probs - 1) as usize)
        }
    }
}
