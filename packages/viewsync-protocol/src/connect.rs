use serde::{Deserialize, Serialize};

/// Query parameters of `/sync/v{N}/connect`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectParams {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Absent or empty means the client has no prior state.
    #[serde(rename = "baseCookie", default)]
    pub base_cookie: Option<String>,
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(default)]
    pub wsid: Option<String>,
}

impl ConnectParams {
    pub fn base_cookie(&self) -> Option<&str> {
        self.base_cookie.as_deref().filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_base_cookie_is_none() {
        let params: ConnectParams = serde_json::from_str(
            r#"{"clientGroupID": "g1", "clientID": "c1", "baseCookie": "", "schemaVersion": 3}"#,
        )
        .unwrap();
        assert_eq!(params.base_cookie(), None);
        assert_eq!(params.schema_version, 3);
    }
}
