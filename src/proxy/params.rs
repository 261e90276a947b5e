//! Typed view of the realtime handshake query string.

use url::form_urlencoded;

/// The query keys the realtime handshake uses. Anything else on the
/// query string is dropped by the projection.
pub const RECOGNIZED_KEYS: [&str; 8] = [
    "clientId",
    "connectionSerial",
    "resume",
    "key",
    "heartbeats",
    "v",
    "format",
    "agent",
];

/// Ordered, nullable projection of the handshake query string.
///
/// Absent keys stay absent when the parameters are reapplied upstream;
/// present keys are forwarded verbatim in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    entries: Vec<(&'static str, String)>,
}

impl ConnectionParams {
    /// Project the recognized keys out of a raw query string.
    pub fn from_query(query: &str) -> Self {
        let mut entries = Vec::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if let Some(known) = RECOGNIZED_KEYS.iter().find(|k| **k == key.as_ref()) {
                entries.push((*known, value.into_owned()));
            }
        }
        Self { entries }
    }

    /// Serialize back to a query string, preserving the original key order.
    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.entries {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Overwrite a recognized key in place, or append it.
    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        debug_assert!(RECOGNIZED_KEYS.contains(&key));
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove a key entirely; it will be absent upstream.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resume(&self) -> Option<&str> {
        self.get("resume")
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get("clientId")
    }

    /// The client requested a binary (packed) transport.
    pub fn wants_binary(&self) -> bool {
        self.get("format").map(|f| f != "json").unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_order_and_values() {
        let query = "v=3&clientId=c1&format=json&resume=abc%2Fdef";
        let params = ConnectionParams::from_query(query);
        assert_eq!(params.to_query(), "v=3&clientId=c1&format=json&resume=abc%2Fdef");
    }

    #[test]
    fn test_unrecognized_keys_are_dropped() {
        let params = ConnectionParams::from_query("clientId=c1&extra=1&v=3");
        assert_eq!(params.get("extra"), None);
        assert_eq!(params.to_query(), "clientId=c1&v=3");
    }

    #[test]
    fn test_absent_keys_stay_absent() {
        let params = ConnectionParams::from_query("v=3");
        assert!(params.resume().is_none());
        assert!(params.client_id().is_none());
        assert!(!params.to_query().contains("resume"));
    }

    #[test]
    fn test_remove_strips_key_from_query() {
        let mut params = ConnectionParams::from_query("clientId=c1&resume=tok&v=3");
        assert_eq!(params.remove("resume").as_deref(), Some("tok"));
        assert!(params.resume().is_none());
        assert_eq!(params.to_query(), "clientId=c1&v=3");
        // removing again is a no-op
        assert_eq!(params.remove("resume"), None);
    }

    #[test]
    fn test_set_overwrites_in_place() {
        let mut params = ConnectionParams::from_query("resume=tok&v=3");
        params.set("resume", "garbage");
        assert_eq!(params.resume(), Some("garbage"));
        assert_eq!(params.to_query(), "resume=garbage&v=3");
    }

    #[test]
    fn test_format_defaults_to_binary() {
        assert!(ConnectionParams::from_query("v=3").wants_binary());
        assert!(ConnectionParams::from_query("format=msgpack").wants_binary());
        assert!(!ConnectionParams::from_query("format=json").wants_binary());
    }

    #[test]
    fn test_empty_query() {
        let params = ConnectionParams::from_query("");
        assert!(params.is_empty());
        assert_eq!(params.to_query(), "");
    }
}
