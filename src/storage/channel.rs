//! Name of the LISTEN/NOTIFY channel used to wake schedulers.

use std::fmt;

use crate::error::TaskError;

/// Channel that task creation and resumption publish on.
pub const DEFAULT_CHANNEL: &str = "tasks";

/// PostgreSQL's identifier length limit.
const MAX_CHANNEL_LEN: usize = 63;

/// A validated notification channel name.
///
/// Must start with a letter or underscore, continue with letters, digits or
/// underscores, and be at most 63 characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, TaskError> {
        let name = name.into();
        if is_identifier(&name) {
            Ok(Self(name))
        } else {
            Err(TaskError::InvalidChannel(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self(DEFAULT_CHANNEL.to_string())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_CHANNEL_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
