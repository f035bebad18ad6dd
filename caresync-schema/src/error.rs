use serde::{Deserialize, Serialize};

/// Standard provider error envelope: `{"error": {"code": 410, "message": ..., "errors": [...]}}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderErrorBody {
    pub error: ProviderErrorObject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderErrorObject {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ProviderErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderErrorDetail {
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProviderErrorBody {
    pub fn has_reason(&self, reason: &str) -> bool {
        self.error.errors.iter().any(|e| e.reason == reason)
    }
}
