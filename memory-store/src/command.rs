//! The line protocol: parsing client commands and rendering replies.
//!
//! Every line is trimmed, lower-cased and split on single spaces. Keywords
//! are positional with no quoting, so `set k a b` is four tokens and lands in
//! the unknown branch.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::store::Store;

/// Sent once when a client connects.
pub const WELCOME: &str = "--- Welcome to RuntimeDB server";

/// Written after every message so an attached terminal knows it can type.
pub const PROMPT: &str = "-> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Exit,
    Unknown { line: String },
}

/// What the connection should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Line(String),
    Close,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let normalized = trimmed.to_lowercase();
        let tokens: Vec<&str> = normalized.split(' ').collect();

        match tokens.as_slice() {
            ["set", key, value] => Command::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
            ["get", key] => Command::Get {
                key: key.to_string(),
            },
            ["delete", key] => Command::Delete {
                key: key.to_string(),
            },
            ["exit"] => Command::Exit,
            _ => Command::Unknown {
                line: trimmed.to_string(),
            },
        }
    }

    pub fn apply(self, store: &Store) -> Reply {
        match self {
            Command::Set { key, value } => {
                store.set(key, value);
                Reply::Line("--- OK, inserted the data".to_string())
            }
            Command::Get { key } => match store.get(&key) {
                Some(value) => Reply::Line(value),
                None => Reply::Line(format!("--- Key {key} not found")),
            },
            Command::Delete { key } => {
                store.delete(&key);
                Reply::Line("--- OK, deleted the data".to_string())
            }
            Command::Exit => Reply::Close,
            Command::Unknown { line } => Reply::Line(format!("--- UNKNOWN: {line}")),
        }
    }
}

/// Writes `message` followed by a newline and the prompt, then flushes.
pub async fn write_reply<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = String::with_capacity(message.len() + 1 + PROMPT.len());
    encoded.push_str(message);
    encoded.push('\n');
    encoded.push_str(PROMPT);
    writer.write_all(encoded.as_bytes()).await?;
    writer.flush().await
}
