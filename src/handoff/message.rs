//! Message envelope: the unit of transport.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::{Lane, RunSource};

/// Header carrying an integration id when the payload has none.
pub const INTEGRATION_HEADER: &str = "integrationId";

/// A handoff message. Empty strings and zero counters mean "unset"; the
/// producer fills defaults before enqueueing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: u32,
    pub tenant_id: String,
    pub session_key: String,
    pub business_key: String,
    pub trace_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_lane: Option<Lane>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RunSource>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Opaque handler data.
    pub payload: serde_json::Map<String, Value>,
}

impl HandoffMessage {
    /// Empty envelope of `message_type`. Transport fields are filled on enqueue.
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = session_key.into();
        self
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = business_key.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.requested_lane = Some(lane);
        self
    }

    pub fn with_source(mut self, source: RunSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set one payload field, replacing any previous value.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// `executionId` from the payload.
    pub fn execution_id(&self) -> Option<&str> {
        payload_str(&self.payload, "executionId")
    }

    /// `integrationId` from the payload, falling back to headers.
    pub fn integration_id(&self) -> Option<&str> {
        payload_str(&self.payload, "integrationId").or_else(|| {
            self.headers
                .get(INTEGRATION_HEADER)
                .map(String::as_str)
                .filter(|s| !s.is_empty())
        })
    }

    /// A copy scheduled for the next delivery attempt.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt.max(1) + 1;
        next
    }
}

fn payload_str<'a>(payload: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
