//! Server configuration: CLI flags with environment fallbacks, mirroring
//! the knobs the inference pipeline actually reads.

use std::net::IpAddr;

use clap::Parser;

use crate::error::ServerError;
use crate::vad::fsm::FsmConfig;
use crate::worker::inference_worker::WorkerConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "whisper-stream",
    about = "Realtime speech-to-text streaming server over WebSocket",
    version
)]
pub struct ServerConfig {
    /// Path to the whisper model (GGML/GGUF).
    #[arg(short = 'm', long = "model", env = "WHISPER_STREAM_MODEL")]
    pub model: String,

    /// Path to a VAD model. Omit to disable VAD; without it no final
    /// transcripts are ever emitted.
    #[arg(long = "vad-model", env = "WHISPER_STREAM_VAD_MODEL")]
    pub vad_model: Option<String>,

    #[arg(short = 'p', long, env = "WHISPER_STREAM_PORT", default_value_t = 9090)]
    pub port: u16,

    #[arg(long, env = "WHISPER_STREAM_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Shared secret. When set, upgrade requests must carry
    /// `?token=<secret>` or they are rejected with 401.
    #[arg(long = "token", env = "WHISPER_STREAM_TOKEN")]
    pub auth_token: Option<String>,

    /// Number of parallel inference contexts.
    #[arg(short = 'c', long, default_value_t = 2)]
    pub contexts: usize,

    /// CPU threads per inference.
    #[arg(short = 't', long, default_value_t = 4)]
    pub threads: i32,

    /// Language code passed to the model.
    #[arg(short = 'l', long, default_value = "en")]
    pub language: String,

    /// Transcription cadence in milliseconds.
    #[arg(long = "step", default_value_t = 500)]
    pub step_ms: u64,

    /// Sliding-window target length in milliseconds.
    #[arg(long = "length", default_value_t = 5000)]
    pub length_ms: u64,

    /// Window overlap in milliseconds.
    #[arg(long = "keep", default_value_t = 200)]
    pub keep_ms: u64,

    #[arg(long = "no-gpu")]
    no_gpu: bool,

    #[arg(long = "no-flash-attn")]
    no_flash_attn: bool,

    /// Translate to English instead of transcribing.
    #[arg(long)]
    pub translate: bool,

    /// Speech probability threshold, 0.0-1.0.
    #[arg(long = "vad-threshold", default_value_t = 0.5)]
    pub vad_threshold: f32,

    /// VAD cadence in milliseconds; also the audio tail length it scores.
    #[arg(long = "vad-check", default_value_t = 30)]
    pub vad_check_ms: u64,

    /// Silence duration that closes an utterance, in milliseconds.
    #[arg(long = "vad-silence", default_value_t = 1000)]
    pub silence_trigger_ms: i64,

    /// Utterances shorter than this are discarded, in milliseconds.
    #[arg(long = "min-speech", default_value_t = 100)]
    pub min_speech_ms: i64,
}

impl ServerConfig {
    pub fn use_gpu(&self) -> bool {
        !self.no_gpu
    }

    pub fn flash_attn(&self) -> bool {
        !self.no_flash_attn
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.model.is_empty() {
            return Err(ServerError::Config("model path must not be empty".into()));
        }
        if self.contexts == 0 {
            return Err(ServerError::Config("contexts must be > 0".into()));
        }
        if self.threads < 1 {
            return Err(ServerError::Config("threads must be > 0".into()));
        }
        if self.step_ms == 0 {
            return Err(ServerError::Config("step must be > 0".into()));
        }
        if self.length_ms == 0 {
            return Err(ServerError::Config("length must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(ServerError::Config(
                "vad-threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if self.vad_check_ms == 0 {
            return Err(ServerError::Config("vad-check must be > 0".into()));
        }
        if self.silence_trigger_ms <= 0 {
            return Err(ServerError::Config("vad-silence must be > 0".into()));
        }
        if self.min_speech_ms < 0 {
            return Err(ServerError::Config("min-speech must be >= 0".into()));
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            step_ms: self.step_ms,
            length_ms: self.length_ms,
            keep_ms: self.keep_ms,
            vad_check_ms: self.vad_check_ms,
            vad_threshold: self.vad_threshold,
            fsm: FsmConfig {
                silence_trigger_ms: self.silence_trigger_ms,
                min_speech_ms: self.min_speech_ms,
            },
        }
    }

    #[cfg(test)]
    pub fn for_tests(auth_token: Option<String>) -> Self {
        let mut cfg = Self::try_parse_from(["whisper-stream", "-m", "models/test.bin"])
            .expect("test config must parse");
        cfg.auth_token = auth_token;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut full = vec!["whisper-stream"];
        full.extend_from_slice(args);
        ServerConfig::try_parse_from(full).expect("args must parse")
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cfg = parse(&["-m", "models/ggml-base.en.bin"]);
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.bind.to_string(), "0.0.0.0");
        assert_eq!(cfg.contexts, 2);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.language, "en");
        assert_eq!(cfg.step_ms, 500);
        assert_eq!(cfg.length_ms, 5000);
        assert_eq!(cfg.keep_ms, 200);
        assert!(cfg.use_gpu());
        assert!(cfg.flash_attn());
        assert!(!cfg.translate);
        assert_eq!(cfg.vad_threshold, 0.5);
        assert_eq!(cfg.vad_check_ms, 30);
        assert_eq!(cfg.silence_trigger_ms, 1000);
        assert_eq!(cfg.min_speech_ms, 100);
        assert!(cfg.vad_model.is_none());
        assert!(cfg.auth_token.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn model_is_required() {
        assert!(ServerConfig::try_parse_from(["whisper-stream"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = parse(&[
            "-m", "m.bin",
            "--vad-model", "vad.bin",
            "-p", "8000",
            "-c", "4",
            "--no-gpu",
            "--translate",
            "--vad-silence", "1500",
            "--token", "hunter2",
        ]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.contexts, 4);
        assert!(!cfg.use_gpu());
        assert!(cfg.translate);
        assert_eq!(cfg.silence_trigger_ms, 1500);
        assert_eq!(cfg.vad_model.as_deref(), Some("vad.bin"));
        assert_eq!(cfg.auth_token.as_deref(), Some("hunter2"));
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let mut cfg = parse(&["-m", "m.bin"]);
        cfg.vad_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&["-m", "m.bin"]);
        cfg.contexts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&["-m", "m.bin"]);
        cfg.step_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&["-m", "m.bin"]);
        cfg.silence_trigger_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_config_mirrors_cadence_settings() {
        let cfg = parse(&["-m", "m.bin", "--step", "250", "--vad-check", "20"]);
        let wc = cfg.worker_config();
        assert_eq!(wc.step_ms, 250);
        assert_eq!(wc.vad_check_ms, 20);
        assert_eq!(wc.fsm.silence_trigger_ms, 1000);
    }
}
