//! AMI message model
//!
//! A block on the wire is an ordered list of `Key: Value` lines. [`Fields`]
//! keeps that order, and lookups are case-insensitive because Asterisk is not
//! consistent about key casing (`ActionID` vs `ActionId`).
//!
//! Incoming blocks are classified into a [`Message`]: a correlated
//! [`Response`], an unsolicited [`Event`], or something unrecognised.

use std::fmt;

/// Key carrying the action name on outgoing blocks
pub const ACTION_KEY: &str = "Action";
/// Key carrying the correlation identifier
pub const ACTION_ID_KEY: &str = "ActionID";
/// Key carrying the event name on event blocks
pub const EVENT_KEY: &str = "Event";
/// Key carrying the status on response blocks
pub const RESPONSE_KEY: &str = "Response";
/// Key carrying the human-readable message on response blocks
pub const MESSAGE_KEY: &str = "Message";

/// Ordered field mapping of one protocol block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, String)>,
}

impl Fields {
    /// Create an empty field mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Append a field, keeping any earlier field with the same key
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace the first field with a matching key, or append it
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Value of the first field whose key matches, ignoring ASCII case
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field with this key is present
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over the fields in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Fields {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// A command to send to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    fields: Fields,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Fields::new(),
        }
    }

    /// Add an action-specific field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(key, value);
        self
    }

    /// `Action: Ping`, used for liveness checks
    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// `Action: Login` with the given credentials
    pub fn login(username: &str, secret: &str, events: Option<&str>) -> Self {
        let action = Self::new("Login")
            .with_field("Username", username)
            .with_field("Secret", secret);
        match events {
            Some(events) => action.with_field("Events", events),
            None => action,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Wire form: action name first, then the correlation id, then the
    /// action's own fields in insertion order
    pub fn to_fields(&self, action_id: &str) -> Fields {
        let mut fields = Fields::new()
            .with(ACTION_KEY, self.name.as_str())
            .with(ACTION_ID_KEY, action_id);
        for (k, v) in self.fields.iter() {
            if k.eq_ignore_ascii_case(ACTION_ID_KEY) || k.eq_ignore_ascii_case(ACTION_KEY) {
                continue;
            }
            fields.push(k, v);
        }
        fields
    }
}

/// An unsolicited notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    name: String,
    fields: Fields,
}

impl Event {
    pub fn new(name: impl Into<String>, fields: Fields) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }
}

/// A reply correlated to an earlier action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    fields: Fields,
}

impl Response {
    pub fn new(fields: Fields) -> Self {
        Self { fields }
    }

    /// Value of the `Response` field (`Success`, `Error`, `Goodbye`, ...)
    pub fn status(&self) -> &str {
        self.fields.get(RESPONSE_KEY).unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.status().eq_ignore_ascii_case("Success")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.fields.get(ACTION_ID_KEY)
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get(MESSAGE_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

/// Classified incoming block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Response(Response),
    Event(Event),
    /// Neither `Response` nor `Event` present
    Unknown(Fields),
}

impl Message {
    /// Classify a decoded block. `Response` wins over `Event` when both are
    /// present.
    pub fn classify(fields: Fields) -> Self {
        if fields.contains(RESPONSE_KEY) {
            return Message::Response(Response::new(fields));
        }
        match fields.get(EVENT_KEY).map(str::to_owned) {
            Some(name) => Message::Event(Event::new(name, fields)),
            None => Message::Unknown(fields),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let fields = Fields::new().with("ActionId", "12").with("Uniqueid", "99.1");
        assert_eq!(fields.get("ActionID"), Some("12"));
        assert_eq!(fields.get("UNIQUEID"), Some("99.1"));
        assert_eq!(fields.get("Channel"), None);
    }

    #[test]
    fn test_set_replaces_first_match() {
        let mut fields = Fields::new().with("A", "1").with("B", "2");
        fields.set("a", "3");
        fields.set("C", "4");
        let collected: Vec<_> = fields.iter().collect();
        assert_eq!(collected, vec![("A", "3"), ("B", "2"), ("C", "4")]);
    }

    #[test]
    fn test_action_wire_fields_order() {
        let action = Action::login("admin", "secret", Some("call,command"));
        let fields = action.to_fields("1");
        let keys: Vec<_> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["Action", "ActionID", "Username", "Secret", "Events"]
        );
        assert_eq!(fields.get("Action"), Some("Login"));
    }

    #[test]
    fn test_action_id_field_cannot_be_overridden() {
        let action = Action::new("Status").with_field("ActionID", "forged");
        let fields = action.to_fields("5");
        assert_eq!(fields.get("ActionID"), Some("5"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_classify() {
        let response = Fields::new().with("Response", "Success").with("ActionID", "3");
        match Message::classify(response) {
            Message::Response(r) => {
                assert!(r.is_success());
                assert_eq!(r.action_id(), Some("3"));
            }
            other => panic!("expected response, got {:?}", other),
        }

        let event = Fields::new().with("Event", "Hangup").with("Uniqueid", "99");
        match Message::classify(event) {
            Message::Event(e) => {
                assert_eq!(e.name(), "Hangup");
                assert_eq!(e.get("uniqueid"), Some("99"));
            }
            other => panic!("expected event, got {:?}", other),
        }

        let unknown = Fields::new().with("Foo", "bar");
        assert!(matches!(Message::classify(unknown), Message::Unknown(_)));
    }

    #[test]
    fn test_error_response() {
        let response = Response::new(
            Fields::new()
                .with("Response", "Error")
                .with("Message", "Authentication failed"),
        );
        assert!(!response.is_success());
        assert_eq!(response.message(), Some("Authentication failed"));
    }
}
