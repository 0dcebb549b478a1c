use serde::{Deserialize, Serialize};

/// A message on the system account's subject space.
///
/// - `origin` names the sending node so a node can ignore its own broadcasts.
/// - `reply` carries the inbox for request/response exchanges.
/// - `payload` is a raw claim, a JSON response, or empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply: Option<String>,
    origin: String,
    #[serde(default)]
    payload: String,
}

impl SystemMessage {
    pub fn new(subject: impl Into<String>, origin: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            origin: origin.into(),
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}
