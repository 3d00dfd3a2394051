//! Session keys: canonical strings grouping runs that are cancelled together.
//!
//! Every domain has a fixed colon-delimited grammar:
//!
//! | Domain            | Key                                           |
//! |-------------------|-----------------------------------------------|
//! | conversation      | `chat:conversation:<id>`                      |
//! | socket            | `chat:ws:<id>`                                |
//! | agent + end user  | `xpert:<agent>:enduser:<id>`                  |
//! | agent + user      | `xpert:<agent>:user:<id>`                     |
//! | sub-agent         | `subagent:<thread>:<agentKey>:<executionId>`  |
//! | channel           | `channel:<provider>:<k>:<v>...`               |
//! | analytics         | `analytics:ws:<session>[:model:<id>]`         |
//! | API request       | `api:tenant:<t>:user:<u>:req:<r>`             |
//!
//! Anything else parses to [`SessionKey::Unknown`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parsed form of a session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionKey {
    Conversation {
        conversation_id: String,
    },
    Socket {
        socket_id: String,
    },
    EndUser {
        agent_id: String,
        end_user_id: String,
    },
    User {
        agent_id: String,
        user_id: String,
    },
    Subagent {
        thread_id: String,
        agent_key: String,
        execution_id: String,
    },
    Channel {
        provider: String,
        /// Ordered key/value pairs identifying the channel conversation.
        parts: Vec<(String, String)>,
    },
    Analytics {
        session_id: String,
        model_id: Option<String>,
    },
    Api {
        tenant_id: String,
        user_id: String,
        request_id: String,
    },
    Unknown {
        raw: String,
    },
}

impl SessionKey {
    /// Key for a chat conversation.
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self::Conversation {
            conversation_id: conversation_id.into(),
        }
    }

    /// Key for a websocket connection.
    pub fn socket(socket_id: impl Into<String>) -> Self {
        Self::Socket {
            socket_id: socket_id.into(),
        }
    }

    /// Key for an agent serving an anonymous end user.
    pub fn end_user(agent_id: impl Into<String>, end_user_id: impl Into<String>) -> Self {
        Self::EndUser {
            agent_id: agent_id.into(),
            end_user_id: end_user_id.into(),
        }
    }

    /// Key for an agent serving a signed-in user.
    pub fn user(agent_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::User {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Key for one sub-agent execution inside a thread.
    pub fn subagent(
        thread_id: impl Into<String>,
        agent_key: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self::Subagent {
            thread_id: thread_id.into(),
            agent_key: agent_key.into(),
            execution_id: execution_id.into(),
        }
    }

    /// Key for a channel conversation. `parts` keep their order.
    pub fn channel<K, V>(provider: impl Into<String>, parts: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Channel {
            provider: provider.into(),
            parts: parts
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Key for an analytics session, optionally pinned to a model.
    pub fn analytics(session_id: impl Into<String>, model_id: Option<String>) -> Self {
        Self::Analytics {
            session_id: session_id.into(),
            model_id,
        }
    }

    /// Key for a single API request.
    pub fn api(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self::Api {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            request_id: request_id.into(),
        }
    }

    /// Parse a canonical key. Never fails: unrecognised input becomes
    /// [`SessionKey::Unknown`].
    pub fn parse(raw: &str) -> Self {
        parse_known(raw).unwrap_or_else(|| Self::Unknown {
            raw: raw.to_string(),
        })
    }

    /// Short domain name, e.g. `"conversation"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conversation { .. } => "conversation",
            Self::Socket { .. } => "socket",
            Self::EndUser { .. } => "end_user",
            Self::User { .. } => "user",
            Self::Subagent { .. } => "subagent",
            Self::Channel { .. } => "channel",
            Self::Analytics { .. } => "analytics",
            Self::Api { .. } => "api",
            Self::Unknown { .. } => "unknown",
        }
    }
}

fn parse_known(raw: &str) -> Option<SessionKey> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    match parts.as_slice() {
        ["chat", "conversation", id] => Some(SessionKey::conversation(*id)),
        ["chat", "ws", id] => Some(SessionKey::socket(*id)),
        ["xpert", agent, "enduser", id] => Some(SessionKey::end_user(*agent, *id)),
        ["xpert", agent, "user", id] => Some(SessionKey::user(*agent, *id)),
        ["subagent", thread, agent_key, execution] => {
            Some(SessionKey::subagent(*thread, *agent_key, *execution))
        }
        ["channel", provider, rest @ ..] if !rest.is_empty() && rest.len() % 2 == 0 => Some(
            SessionKey::channel(*provider, rest.chunks(2).map(|kv| (kv[0], kv[1]))),
        ),
        ["analytics", "ws", session] => Some(SessionKey::analytics(*session, None)),
        ["analytics", "ws", session, "model", model] => {
            Some(SessionKey::analytics(*session, Some(model.to_string())))
        }
        ["api", "tenant", tenant, "user", user, "req", request] => {
            Some(SessionKey::api(*tenant, *user, *request))
        }
        _ => None,
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation { conversation_id } => {
                write!(f, "chat:conversation:{conversation_id}")
            }
            Self::Socket { socket_id } => write!(f, "chat:ws:{socket_id}"),
            Self::EndUser {
                agent_id,
                end_user_id,
            } => write!(f, "xpert:{agent_id}:enduser:{end_user_id}"),
            Self::User { agent_id, user_id } => write!(f, "xpert:{agent_id}:user:{user_id}"),
            Self::Subagent {
                thread_id,
                agent_key,
                execution_id,
            } => write!(f, "subagent:{thread_id}:{agent_key}:{execution_id}"),
            Self::Channel { provider, parts } => {
                write!(f, "channel:{provider}")?;
                for (k, v) in parts {
                    write!(f, ":{k}:{v}")?;
                }
                Ok(())
            }
            Self::Analytics {
                session_id,
                model_id,
            } => {
                write!(f, "analytics:ws:{session_id}")?;
                if let Some(model_id) = model_id {
                    write!(f, ":model:{model_id}")?;
                }
                Ok(())
            }
            Self::Api {
                tenant_id,
                user_id,
                request_id,
            } => write!(f, "api:tenant:{tenant_id}:user:{user_id}:req:{request_id}"),
            Self::Unknown { raw } => f.write_str(raw),
        }
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}
