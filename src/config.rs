use sbcore::identity::Identity;
use sbcore::session::ReconnectPolicy;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub uid: String,
    pub password: String,
    pub realm: String,
    /// Where the transport connects, e.g. `wss://pbx.example.com/ws`.
    pub endpoint: String,
    pub resource_prefix: String,
    pub protocol: String,
    /// Skip the initial presence broadcast after each connect.
    pub silent: bool,
    /// Seconds a request waits for its reply.
    pub request_timeout: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uid: String::new(),
            password: String::new(),
            realm: String::new(),
            endpoint: String::new(),
            resource_prefix: "web".to_string(),
            protocol: "wss".to_string(),
            silent: false,
            request_timeout: 75,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub(crate) fn identity(&self) -> Identity {
        Identity::new(
            &self.uid,
            &self.password,
            &self.realm,
            &self.resource_prefix,
            &self.protocol,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_fills_defaults() {
        let json = r#"{
            "uid": "201",
            "password": "secret",
            "realm": "pbx.local",
            "reconnect": {"backoff_max": 8}
        }"#;
        let config = ClientConfig::from_json(json).unwrap();

        assert_eq!(config.uid, "201");
        assert_eq!(config.resource_prefix, "web");
        assert_eq!(config.request_timeout(), Duration::from_secs(75));
        assert_eq!(config.reconnect.backoff_min, 2);
        assert_eq!(config.reconnect.backoff_max, 8);
        assert!(!config.silent);
    }
}
