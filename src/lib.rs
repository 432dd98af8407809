pub mod blob;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod protocol;

pub use cli::prompt;
pub use command::Command;
pub use config::{ClientConfig, ServerConfig, TransferConfig};
pub use error::DtpError;
pub use protocol::{Client, RawData, RawDataScope, Responder, Server};
