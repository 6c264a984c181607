use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// Who is joining which channel, and where the relay lives.
///
/// A clustered relay can be reached through several endpoints: `endpoint` is
/// tried first, then each of `fallback_endpoints` in order, until one accepts
/// the signaling connection.
///
/// Metadata values are opaque: they are forwarded to the relay verbatim and
/// never inspected. `Some(Value::Null)` is sent as an explicit `null`, `None`
/// omits the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_endpoints: Vec<String>,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_metadata: Option<Value>,
}

impl SessionIdentity {
    pub fn new(endpoint: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fallback_endpoints: Vec::new(),
            channel_id: channel_id.into(),
            client_id: None,
            bundle_id: None,
            metadata: None,
            notify_metadata: None,
        }
    }

    pub fn with_fallback_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fallback_endpoints.push(endpoint.into());
        self
    }

    /// Every endpoint in the order they are tried.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.endpoint.as_str())
            .chain(self.fallback_endpoints.iter().map(String::as_str))
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_notify_metadata(mut self, metadata: Value) -> Self {
        self.notify_metadata = Some(metadata);
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.endpoints().any(|endpoint| endpoint.trim().is_empty()) {
            return Err(SessionError::ConfigurationInvalid(
                "endpoint must not be empty".into(),
            ));
        }
        if self.channel_id.is_empty() {
            return Err(SessionError::ConfigurationInvalid(
                "channel id must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_channel_is_invalid() {
        let identity = SessionIdentity::new("wss://relay.example/signaling", "");
        assert!(identity.validate().is_err());
    }

    #[test]
    fn blank_endpoint_is_invalid() {
        let identity = SessionIdentity::new("  ", "room");
        assert!(identity.validate().is_err());
    }

    #[test]
    fn fallback_endpoints_follow_the_primary() {
        let identity = SessionIdentity::new("wss://a.relay.example/signaling", "room")
            .with_fallback_endpoint("wss://b.relay.example/signaling")
            .with_fallback_endpoint("wss://c.relay.example/signaling");
        assert_eq!(
            identity.endpoints().collect::<Vec<_>>(),
            [
                "wss://a.relay.example/signaling",
                "wss://b.relay.example/signaling",
                "wss://c.relay.example/signaling",
            ]
        );
        assert!(identity.validate().is_ok());
        assert!(identity.with_fallback_endpoint("").validate().is_err());
    }

    #[test]
    fn builder_keeps_opaque_metadata() {
        let identity = SessionIdentity::new("wss://relay.example/signaling", "room")
            .with_client_id("alice-phone")
            .with_metadata(json!({"access_token": "xyz", "nested": [1, null]}))
            .with_notify_metadata(Value::Null);
        assert!(identity.validate().is_ok());
        assert_eq!(
            identity.metadata,
            Some(json!({"access_token": "xyz", "nested": [1, null]}))
        );
        assert_eq!(identity.notify_metadata, Some(Value::Null));
    }
}
