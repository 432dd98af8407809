//! Commands understood by the interactive blob client.
//!
//! This module defines the [`Command`] enum, which the `dtp_client` shell
//! parses from each input line before turning it into a
//! [`BlobRequest`](crate::blob::BlobRequest).
//!
//! # Overview
//! The supported commands are:
//!
//! - `ping`: check the server is answering.
//! - `put <path> [name]`: upload a local file, named after the file by default.
//! - `get <name> <path>`: download a blob into a local file.
//! - `list`: list stored blobs.
//! - `remove <name>`: delete a blob.
//! - `.exit`: leave the shell.
//!
//! # Example
//! ```rust
//! use dtp::Command;
//!
//! let cmd: Command = "get report.pdf /tmp/report.pdf".try_into().unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Get {
//!         name: "report.pdf".to_string(),
//!         path: "/tmp/report.pdf".into(),
//!     }
//! );
//! ```
use std::path::PathBuf;

use thiserror::Error;

/// List of possible error that a command can throw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Put { path: PathBuf, name: String },
    Get { name: String, path: PathBuf },
    List,
    Remove { name: String },
    /// Close the connection and leave the shell.
    Exit,
}

fn arguments(command: &str, args: &[&str], usage: &str, count: usize) -> Result<(), CommandError> {
    if args.len() < count {
        return Err(CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("usage: {usage}"),
        });
    }
    Ok(())
}

impl TryInto<Command> for &str {
    type Error = CommandError;

    fn try_into(self) -> Result<Command, Self::Error> {
        let parts = self.split_whitespace().collect::<Vec<&str>>();
        let Some((command, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };

        match command.to_lowercase().as_str() {
            ".exit" => Ok(Command::Exit),
            "ping" => Ok(Command::Ping),
            "list" => Ok(Command::List),
            "remove" => {
                arguments(command, args, "remove <name>", 1)?;
                Ok(Command::Remove {
                    name: args[0].to_string(),
                })
            }
            "get" => {
                arguments(command, args, "get <name> <path>", 2)?;
                Ok(Command::Get {
                    name: args[0].to_string(),
                    path: PathBuf::from(args[1]),
                })
            }
            "put" => {
                arguments(command, args, "put <path> [name]", 1)?;
                let path = PathBuf::from(args[0]);
                let name = match args.get(1) {
                    Some(name) => name.to_string(),
                    None => path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                        .ok_or_else(|| CommandError::InvalidCommandArguments {
                            command: command.to_string(),
                            reason: format!("cannot name a blob after '{}'", args[0]),
                        })?,
                };
                Ok(Command::Put { path, name })
            }
            _ => Err(CommandError::UnrecognizedCommand(self.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            ("ping", Command::Ping),
            ("LIST", Command::List),
            (
                "remove old.bin",
                Command::Remove {
                    name: "old.bin".to_string(),
                },
            ),
            (
                "put ./data/archive.tar",
                Command::Put {
                    path: PathBuf::from("./data/archive.tar"),
                    name: "archive.tar".to_string(),
                },
            ),
            (
                "put ./data/archive.tar backup",
                Command::Put {
                    path: PathBuf::from("./data/archive.tar"),
                    name: "backup".to_string(),
                },
            ),
        ];

        for (cmd, expected) in inputs {
            let command: Command = cmd.try_into().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    fn missing_arguments() {
        let res: Result<Command, _> = "get only-name".try_into();
        assert!(matches!(
            res,
            Err(CommandError::InvalidCommandArguments { .. })
        ));
    }

    #[test]
    fn empty_and_unknown() {
        let res: Result<Command, _> = "   ".try_into();
        assert_eq!(res, Err(CommandError::Empty));

        let res: Result<Command, _> = "fly away".try_into();
        assert_eq!(
            res,
            Err(CommandError::UnrecognizedCommand("fly away".to_string()))
        );
    }
}
