use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AclScope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl AclScope {
    pub fn user(email: impl Into<String>) -> Self {
        Self {
            kind: "user".to_string(),
            value: Some(email.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AclRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub scope: AclScope,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AclListPage {
    #[serde(default)]
    pub items: Vec<AclRule>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Ordering of ACL roles, weakest first. Unknown roles rank as `none`.
pub fn role_rank(role: &str) -> u8 {
    match role {
        "freeBusyReader" => 1,
        "reader" => 2,
        "writer" => 3,
        "owner" => 4,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_outranks_writer() {
        assert!(role_rank("owner") > role_rank("writer"));
        assert!(role_rank("writer") > role_rank("reader"));
        assert_eq!(role_rank("none"), 0);
    }
}
