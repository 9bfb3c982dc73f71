use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    Other(Command),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        let Some(&first) = payload.first() else {
            return ClientCommand::Other(Command::Unknown);
        };

        let data = &payload[1..];
        match Command::from(first) {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(data).into_owned()),
            Command::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(data).into_owned()),
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            other => ClientCommand::Other(other),
        }
    }

    /// SQL text of a `COM_QUERY`
    pub fn sql(&self) -> Option<&str> {
        match self {
            ClientCommand::Query(sql) => Some(sql),
            _ => None,
        }
    }
}
