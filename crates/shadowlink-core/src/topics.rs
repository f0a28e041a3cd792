//! Topic layout for commands, responses and shadow traffic.
//!
//! | Purpose | Topic |
//! |---------|-------|
//! | Command | `{namespace}/{device_id}/commands/{action}` |
//! | Response | `{namespace}/{device_id}/responses/{request_id}` |
//! | Shadow update | `{shadow_prefix}/update` |
//! | Desired delta | `{shadow_prefix}/update/delta` |

use crate::error::{Error, Result};

const COMMANDS: &str = "commands";
const RESPONSES: &str = "responses";
/// Response topic segment used when the request id could not be recovered.
pub const UNKNOWN_REQUEST: &str = "unknown";

/// Device id and action addressed by a command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub device_id: String,
    pub action: String,
}

/// Builds and parses the topics one bridge session uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    namespace: String,
    shadow_prefix: String,
}

impl TopicLayout {
    pub fn new(namespace: impl Into<String>, shadow_prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim_end_matches('/').to_string(),
            shadow_prefix: shadow_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Layout using the conventional device shadow prefix for `thing_name`.
    pub fn for_thing(namespace: impl Into<String>, thing_name: &str) -> Self {
        Self::new(namespace, format!("$aws/things/{}/shadow", thing_name))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wildcard filter covering every device and every action.
    pub fn command_filter(&self) -> String {
        format!("{}/+/{}/+", self.namespace, COMMANDS)
    }

    pub fn command_topic(&self, device_id: &str, action: &str) -> String {
        format!("{}/{}/{}/{}", self.namespace, device_id, COMMANDS, action)
    }

    /// Response topic. A request id that is empty or not usable as a single
    /// topic level (separators, wildcards, NUL) maps to [`UNKNOWN_REQUEST`].
    pub fn response_topic(&self, device_id: &str, request_id: &str) -> String {
        let request_id = if is_topic_level(request_id) {
            request_id
        } else {
            UNKNOWN_REQUEST
        };
        format!("{}/{}/{}/{}", self.namespace, device_id, RESPONSES, request_id)
    }

    pub fn shadow_update_topic(&self) -> String {
        format!("{}/update", self.shadow_prefix)
    }

    pub fn shadow_delta_topic(&self) -> String {
        format!("{}/update/delta", self.shadow_prefix)
    }

    /// Extract device id and action from a command topic.
    pub fn parse_command_topic(&self, topic: &str) -> Result<CommandTopic> {
        let rest = topic
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| Error::InvalidTopic(format!("outside namespace: {}", topic)))?;

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [device_id, COMMANDS, action] if !device_id.is_empty() && !action.is_empty() => {
                Ok(CommandTopic {
                    device_id: device_id.to_string(),
                    action: action.to_string(),
                })
            }
            _ => Err(Error::InvalidTopic(format!("not a command topic: {}", topic))),
        }
    }

    pub fn is_command_topic(&self, topic: &str) -> bool {
        topic_matches(&self.command_filter(), topic)
    }

    pub fn is_delta_topic(&self, topic: &str) -> bool {
        topic == self.shadow_delta_topic()
    }
}

fn is_topic_level(level: &str) -> bool {
    !level.is_empty() && !level.contains(['/', '+', '#', '\0'])
}

/// MQTT topic filter matching (`+` one level, trailing `#` any remainder).
///
/// Wildcards in the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
