//! Server-to-client JSON frames. Every egress frame is one of these four
//! objects, serialized to a single text message.

use serde_json::json;

/// Sent once, immediately after a successful upgrade.
pub fn ready_message(model: &str, contexts: usize) -> String {
    json!({"type": "ready", "model": model, "contexts": contexts}).to_string()
}

/// A transcription hypothesis during ongoing speech; may change later.
pub fn partial_message(text: &str) -> String {
    json!({"type": "partial", "text": text}).to_string()
}

/// The finished utterance transcript; never revised.
pub fn final_message(text: &str) -> String {
    json!({"type": "final", "text": text}).to_string()
}

pub fn error_message(message: &str) -> String {
    json!({"type": "error", "message": message}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn ready_carries_model_and_pool_size() {
        let msg: Value = serde_json::from_str(&ready_message("models/ggml-base.en.bin", 2)).unwrap();
        assert_eq!(msg["type"], "ready");
        assert_eq!(msg["model"], "models/ggml-base.en.bin");
        assert_eq!(msg["contexts"], 2);
    }

    #[test]
    fn text_frames_round_trip_through_json() {
        let msg: Value = serde_json::from_str(&partial_message("with \"quotes\" and\nnewline")).unwrap();
        assert_eq!(msg["text"], "with \"quotes\" and\nnewline");

        let msg: Value = serde_json::from_str(&final_message("done")).unwrap();
        assert_eq!(msg["type"], "final");

        let msg: Value = serde_json::from_str(&error_message("nope")).unwrap();
        assert_eq!(msg["message"], "nope");
    }
}
