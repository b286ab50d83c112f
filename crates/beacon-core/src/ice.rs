//! ICE server descriptors
//!
//! Serialized with the field names browsers expect in `RTCIceServer`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::turn::TurnCredential;

/// A single ICE server entry handed to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One or more connection URLs (`stun:`, `turn:`, `turns:`)
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN descriptor for `host:port`
    pub fn stun(host: &str, port: u16) -> Self {
        Self {
            urls: vec![format!("stun:{}:{}", host, port)],
            username: None,
            credential: None,
        }
    }

    /// TURN descriptor for `host:port` carrying ephemeral credentials
    pub fn turn(host: &str, port: u16, creds: TurnCredential) -> Self {
        Self {
            urls: vec![format!("turn:{}:{}", host, port)],
            username: Some(creds.username),
            credential: Some(creds.password),
        }
    }

    pub fn is_stun(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("stun:"))
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// `urls` as it appears on the wire: a single URL or a list
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url],
            IceUrls::Many(urls) => urls,
        }
    }
}

/// Accepts `"urls": "stun:..."` as well as `"urls": ["stun:...", ...]`
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(IceUrls::deserialize(deserializer)?.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_descriptor() {
        let stun = IceServer::stun("stun.example.org", 3478);
        assert_eq!(stun.urls, vec!["stun:stun.example.org:3478"]);
        assert!(stun.is_stun());
        assert!(!stun.is_turn());

        // Optional fields are left out entirely
        let json = serde_json::to_string(&stun).unwrap();
        assert_eq!(json, r#"{"urls":["stun:stun.example.org:3478"]}"#);
    }

    #[test]
    fn test_turn_descriptor() {
        let creds = TurnCredential {
            username: "1700021600:alice".into(),
            password: "pw".into(),
            expires_at: 1_700_021_600,
        };
        let turn = IceServer::turn("turn.example.org", 3478, creds);

        assert!(turn.is_turn());
        assert_eq!(turn.username.as_deref(), Some("1700021600:alice"));
        assert_eq!(turn.credential.as_deref(), Some("pw"));
    }

    #[test]
    fn test_urls_accepts_single_string() {
        let json = r#"{"urls":"turn:global.turn.example.com:3478?transport=udp","username":"u","credential":"c"}"#;
        let server: IceServer = serde_json::from_str(json).unwrap();
        assert_eq!(
            server.urls,
            vec!["turn:global.turn.example.com:3478?transport=udp"]
        );
        assert_eq!(server.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_ice_urls_keep_order() {
        let many: IceUrls = serde_json::from_str(r#"["turn:a:443","turns:a:443"]"#).unwrap();
        assert_eq!(many.into_vec(), vec!["turn:a:443", "turns:a:443"]);

        let one: IceUrls = serde_json::from_str(r#""stun:a:3478""#).unwrap();
        assert_eq!(one, IceUrls::One("stun:a:3478".into()));
    }
}
