//! Structured responses returned across the host boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use teambook_core::TeambookError;

/// The uniform result every kernel verb produces.
///
/// Hosts render this into pipe-delimited CLI output, JSON-RPC tool
/// responses, or HTTP JSON. Validation and quota failures arrive here as
/// values; nothing is thrown across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl KernelResponse {
    pub fn ok(message: impl Into<String>, data: JsonValue) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
            details: None,
            suggestion: None,
        }
    }

    pub fn err(error: TeambookError) -> Self {
        Self {
            success: false,
            message: error.message.clone(),
            data: None,
            suggestion: error.code.suggestion().map(String::from),
            error: Some(error.code.as_str().to_string()),
            details: error.details,
        }
    }

    /// Pipe-mode rendering: one line, `!code[|detail]` for errors.
    pub fn to_pipe(&self) -> String {
        if self.success {
            match &self.data {
                Some(JsonValue::String(s)) => s.clone(),
                Some(data) => data.to_string(),
                None => self.message.clone(),
            }
        } else {
            let code = self.error.as_deref().unwrap_or("unknown_error");
            if self.message.is_empty() {
                format!("!{}", code)
            } else {
                format!("!{}|{}", code, self.message)
            }
        }
    }
}

impl From<Result<KernelResponse, TeambookError>> for KernelResponse {
    fn from(result: Result<KernelResponse, TeambookError>) -> Self {
        result.unwrap_or_else(KernelResponse::err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use teambook_core::ErrorCode;

    #[test]
    fn test_ok_response_shape() {
        let resp = KernelResponse::ok("stored", json!({"note_id": 1}));
        assert!(resp.success);
        assert!(resp.error.is_none());
        let rendered = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(rendered["data"]["note_id"], 1);
    }

    #[test]
    fn test_error_carries_code_and_suggestion() {
        let resp = KernelResponse::err(TeambookError::new(ErrorCode::RateLimit, "too fast"));
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("rate_limit"));
        assert_eq!(resp.suggestion.as_deref(), Some("wait 60 seconds"));
        assert_eq!(resp.to_pipe(), "!rate_limit|too fast");
    }
}
