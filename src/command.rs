use crate::error::{HeosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Extra parameters carried by a command instance (e.g. `pid`, `level`)
pub type Attributes = BTreeMap<String, String>;

/// Identity of a HEOS protocol operation, `group/command`
///
/// A command may carry [`Attributes`], but they never take part in equality,
/// hashing or listener routing: `player/get_volume?pid=1` and
/// `player/get_volume` are the same identity.
///
/// # Example
///
/// ```
/// use heos_control::HeosCommand;
///
/// let cmd: HeosCommand = "system/heart_beat".parse().unwrap();
/// assert_eq!(cmd.group(), "system");
/// assert_eq!(cmd.command(), "heart_beat");
/// assert_eq!(cmd.to_string(), "system/heart_beat");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HeosCommand {
    group: String,
    command: String,
    attributes: Attributes,
}

impl HeosCommand {
    /// Build a command from its two segments
    ///
    /// Both segments must be non-empty and must not contain `/`.
    pub fn new(group: impl Into<String>, command: impl Into<String>) -> Result<Self> {
        let group = group.into();
        let command = command.into();
        if !is_valid_segment(&group) || !is_valid_segment(&command) {
            return Err(HeosError::MalformedCommand(format!("{}/{}", group, command)));
        }
        Ok(Self {
            group,
            command,
            attributes: Attributes::new(),
        })
    }

    /// Parse a `group/command` string
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(command), None) if !group.is_empty() && !command.is_empty() => {
                Ok(Self {
                    group: group.to_string(),
                    command: command.to_string(),
                    attributes: Attributes::new(),
                })
            }
            _ => Err(HeosError::MalformedCommand(format!(
                "expected exactly two non-empty segments in {:?}",
                text
            ))),
        }
    }

    /// Command group, e.g. `system`
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Command name within the group, e.g. `heart_beat`
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Attach an attribute, replacing any previous value for `name`
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(name.into(), value.to_string());
        self
    }

    /// All attributes attached to this instance
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Look up a single attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Copy of this command with the attributes stripped
    pub fn identity(&self) -> Self {
        Self {
            group: self.group.clone(),
            command: self.command.clone(),
            attributes: Attributes::new(),
        }
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/')
}

impl PartialEq for HeosCommand {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.command == other.command
    }
}

impl Eq for HeosCommand {}

impl Hash for HeosCommand {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.command.hash(state);
    }
}

impl fmt::Display for HeosCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.command)
    }
}

impl FromStr for HeosCommand {
    type Err = HeosError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HeosCommand {
    type Error = HeosError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<HeosCommand> for String {
    fn from(cmd: HeosCommand) -> Self {
        cmd.to_string()
    }
}
