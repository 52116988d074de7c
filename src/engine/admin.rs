//! Administrative commands.
//!
//! Plain text, one command per line, from the control channel or the stdin
//! console. Every command acts on the store; clients learn about the effect
//! through normal change propagation.

use crate::core::error::{SyncError, SyncResult};
use crate::store::EntityId;
use serde_json::Value;

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    DeletePlot(EntityId),
    DeleteLink(EntityId),
    Rename { client: EntityId, name: String },
    /// Ask a client to calibrate again.
    Calibrate(EntityId),
    /// Toggle a client's debug flag.
    Debug(EntityId),
    /// Tell a web client to reload itself.
    Restart(String),
    /// Push a configuration object to a web client.
    Configure { client: String, config: Value },
    /// Recompute every plot.
    Reload,
    Help,
}

/// Usage text.
pub const USAGE: &str = "\
delete plot <id>
delete link <id>
rename <clientId> <name>
calibrate <clientId>
debug <clientId>
restart <webClientName>
configure <webClientName> <json>
reload
help";

fn parse_id(word: Option<&str>, what: &str) -> SyncResult<EntityId> {
    let word = word.ok_or_else(|| SyncError::invalid_request(format!("missing {what}")))?;
    word.parse()
        .map_err(|_| SyncError::invalid_request(format!("invalid {what}: {word}")))
}

fn required<'a>(word: Option<&'a str>, what: &str) -> SyncResult<&'a str> {
    word.filter(|w| !w.is_empty())
        .ok_or_else(|| SyncError::invalid_request(format!("missing {what}")))
}

impl AdminCommand {
    /// Parse one command line.
    pub fn parse(line: &str) -> SyncResult<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut words = rest.split_whitespace();

        match verb.to_ascii_lowercase().as_str() {
            "delete" => match words.next() {
                Some("plot") => Ok(Self::DeletePlot(parse_id(words.next(), "plot id")?)),
                Some("link") => Ok(Self::DeleteLink(parse_id(words.next(), "link id")?)),
                other => Err(SyncError::invalid_request(format!(
                    "cannot delete {}",
                    other.unwrap_or("nothing")
                ))),
            },
            "rename" => {
                let client = parse_id(words.next(), "client id")?;
                let name = words.collect::<Vec<_>>().join(" ");
                Ok(Self::Rename {
                    client,
                    name: required(Some(name.as_str()), "name")?.to_string(),
                })
            }
            "calibrate" => Ok(Self::Calibrate(parse_id(words.next(), "client id")?)),
            "debug" => Ok(Self::Debug(parse_id(words.next(), "client id")?)),
            "restart" => Ok(Self::Restart(required(words.next(), "client name")?.to_string())),
            "configure" => {
                let (client, json) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let client = required(Some(client), "client name")?.to_string();
                let config = serde_json::from_str(required(Some(json.trim()), "configuration")?)
                    .map_err(|e| SyncError::invalid_request(format!("invalid configuration: {e}")))?;
                Ok(Self::Configure { client, config })
            }
            "reload" => Ok(Self::Reload),
            "help" | "?" => Ok(Self::Help),
            "" => Err(SyncError::invalid_request("empty command")),
            other => Err(SyncError::invalid_request(format!("unknown command: {other}"))),
        }
    }
}
