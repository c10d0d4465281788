//! Validation of generation prompt payloads.
//!
//! The orchestrator does not interpret prompts; it only refuses payloads
//! that no backend could possibly accept.

use crate::error::CoreError;

/// Upper bound on the serialized size of a single prompt payload.
pub const MAX_PROMPT_BYTES: usize = 4 * 1024 * 1024;

/// Validate a prompt payload before it is enqueued.
///
/// Rules:
/// - Must not be `null`.
/// - Strings must contain non-whitespace text.
/// - Objects and arrays must not be empty.
/// - Serialized size must not exceed `MAX_PROMPT_BYTES`.
pub fn validate_prompt(prompt: &serde_json::Value) -> Result<(), CoreError> {
    use serde_json::Value;

    let empty = match prompt {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Bool(_) | Value::Number(_) => {
            return Err(CoreError::Validation(
                "Prompt must be text or a workflow object".to_string(),
            ));
        }
    };
    if empty {
        return Err(CoreError::Validation("Prompt must not be empty".to_string()));
    }

    let size = serde_json::to_vec(prompt)
        .map_err(|e| CoreError::Validation(format!("Prompt is not serializable: {e}")))?
        .len();
    if size > MAX_PROMPT_BYTES {
        return Err(CoreError::Validation(format!(
            "Prompt must not exceed {MAX_PROMPT_BYTES} bytes"
        )));
    }

    Ok(())
}
