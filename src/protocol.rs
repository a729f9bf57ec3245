use crate::command::HeosCommand;
use crate::error::{HeosError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// URI scheme prefix for outbound command lines
const REQUEST_SCHEME: &str = "heos://";

/// Interim acknowledgement sent by the device before the real result
const UNDER_PROCESS: &str = "command under process";

/// One inbound message, decoded from a single JSON line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "heos")]
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Response header (`heos` object on the wire)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub command: HeosCommand,
    pub result: CommandResult,
    #[serde(default, skip_serializing_if = "ResponseMessage::is_empty")]
    pub message: ResponseMessage,
}

/// Outcome reported by the device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandResult {
    Success,
    Fail,
}

impl CommandResult {
    /// Wire form, `success` or `fail`
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandResult::Success => "success",
            CommandResult::Fail => "fail",
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message parameters of a response, kept as received
///
/// The device encodes parameters as `name=value` pairs joined by `&`;
/// [`ResponseMessage::parsed`] splits them on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseMessage {
    raw: String,
}

impl ResponseMessage {
    /// Wrap a raw message string
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The message exactly as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Split into parameters
    ///
    /// A part without `=` maps to an empty value, so flags such as
    /// `signed_in` survive the round trip.
    pub fn parsed(&self) -> BTreeMap<String, String> {
        self.raw
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((name, value)) => (decode_component(name), decode_component(value)),
                None => (decode_component(part), String::new()),
            })
            .collect()
    }

    /// Single parameter lookup
    pub fn get(&self, name: &str) -> Option<String> {
        self.parsed().remove(name)
    }
}

impl Response {
    /// Decode one line of the inbound stream
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Encode as a single line (without terminator)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Command identity this response belongs to
    pub fn command(&self) -> &HeosCommand {
        &self.header.command
    }

    /// Check if the device reported success
    pub fn is_success(&self) -> bool {
        self.header.result == CommandResult::Success
    }

    /// Check if this is the interim "command under process" acknowledgement
    pub fn is_under_process(&self) -> bool {
        self.header.message.raw().trim() == UNDER_PROCESS
    }
}

/// Encode a command as an outbound request line, including the `\r\n` terminator
pub fn encode_request(command: &HeosCommand) -> Result<String> {
    let mut line = format!("{}{}", REQUEST_SCHEME, command);
    let mut separator = '?';
    for (name, value) in command.attributes() {
        if name.is_empty() || name.contains(&['&', '=', '?', '/'][..]) {
            return Err(HeosError::InvalidArgument(format!(
                "invalid attribute name {:?} on {}",
                name, command
            )));
        }
        line.push(separator);
        line.push_str(name);
        line.push('=');
        line.push_str(&encode_component(value));
        separator = '&';
    }
    line.push_str("\r\n");
    Ok(line)
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

fn decode_component(value: &str) -> String {
    // %25 last, otherwise "%2526" would decode twice
    value
        .replace("%26", "&")
        .replace("%3D", "=")
        .replace("%3d", "=")
        .replace("%25", "%")
}
