//! Channel naming and routing
//!
//! Grammar: `["<prefix>:"] "notifications" ":" ( "system" | ("user"|"role") ":" <id> )`

use crate::error::ChannelError;

/// Namespace segment every notification channel starts with
pub const NAMESPACE: &str = "notifications";

const USER: &str = "user";
const ROLE: &str = "role";
const SYSTEM: &str = "system";

/// Delivery scope encoded in a channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    User,
    Role,
    System,
}

/// Result of parsing a channel name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChannel {
    pub scope: ChannelScope,
    /// Target id; empty for the system channel
    pub id: String,
}

/// Builds and parses channel names, optionally under a tenant prefix.
///
/// Constructed explicitly and handed to the components that need it.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    prefix: Option<String>,
}

impl ChannelRouter {
    /// Router without a tenant prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Router that qualifies every channel with `prefix:`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn qualify(&self, rest: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{NAMESPACE}:{rest}"),
            None => format!("{NAMESPACE}:{rest}"),
        }
    }

    /// Channel for a single user; empty when `user_id` is empty
    pub fn user_channel(&self, user_id: &str) -> String {
        if user_id.is_empty() {
            return String::new();
        }
        self.qualify(&format!("{USER}:{user_id}"))
    }

    /// Channel for a role cohort, upper-cased; empty when `role` is empty
    pub fn role_channel(&self, role: &str) -> String {
        if role.is_empty() {
            return String::new();
        }
        self.qualify(&format!("{ROLE}:{}", role.to_uppercase()))
    }

    /// Channel every client listens on
    pub fn system_channel(&self) -> String {
        self.qualify(SYSTEM)
    }

    /// Pattern matching every notification channel
    pub fn wildcard_pattern(&self) -> String {
        self.qualify("*")
    }

    /// Parse a channel name into its scope and target id
    pub fn parse_channel(&self, channel: &str) -> Result<ParsedChannel, ChannelError> {
        let rest = match &self.prefix {
            Some(prefix) => channel
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .ok_or_else(|| ChannelError::MissingPrefix {
                    channel: channel.to_string(),
                    prefix: prefix.clone(),
                })?,
            None => channel,
        };

        let parts: Vec<&str> = rest.split(':').collect();
        if parts[0] != NAMESPACE {
            return Err(ChannelError::InvalidNamespace(channel.to_string()));
        }

        match parts.as_slice() {
            [_, SYSTEM] => Ok(ParsedChannel {
                scope: ChannelScope::System,
                id: String::new(),
            }),
            [_, scope @ (USER | ROLE), id] => {
                if id.is_empty() {
                    return Err(ChannelError::MissingId(channel.to_string()));
                }
                let scope = if *scope == USER {
                    ChannelScope::User
                } else {
                    ChannelScope::Role
                };
                Ok(ParsedChannel {
                    scope,
                    id: id.to_string(),
                })
            }
            _ => Err(ChannelError::UnknownScope(channel.to_string())),
        }
    }

    pub fn is_valid_channel_name(&self, channel: &str) -> bool {
        self.parse_channel(channel).is_ok()
    }

    /// Default subscription set for a connecting client: user, role, system.
    ///
    /// Channels whose identity is empty are left out.
    pub fn channels_for_user(&self, user_id: &str, role: &str) -> Vec<String> {
        [
            self.user_channel(user_id),
            self.role_channel(role),
            self.system_channel(),
        ]
        .into_iter()
        .filter(|channel| !channel.is_empty())
        .collect()
    }
}
