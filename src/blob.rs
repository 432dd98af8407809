//! Directory-backed blob store served over DTP.
//!
//! Blob contents never travel inside the structured messages: `Put` carries
//! a [`RawData`] the server pulls from the client, `Get` answers with a
//! [`RawData`] the server pushes from the file on disk.
use std::{
    fs::{self, File},
    io,
    net::SocketAddr,
    path::PathBuf,
};

use bincode::{Decode, Encode};
use log::{debug, info};

use crate::{
    command::Command,
    protocol::{Client, RawData, RawDataScope, Responder},
};

#[derive(Debug, Encode, Decode)]
#[bincode(decode_context = "RawDataScope")]
pub enum BlobRequest {
    Ping,
    Put { name: String, data: RawData },
    Get { name: String },
    List,
    Remove { name: String },
}

#[derive(Debug, Encode, Decode)]
#[bincode(decode_context = "RawDataScope")]
pub enum BlobResponse {
    Pong,
    Stored { name: String, size: u64 },
    Blob { name: String, size: u64, data: RawData },
    Names(Vec<String>),
    Removed { name: String },
    Err { code: BlobError, description: String },
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum BlobError {
    NotFound,
    InvalidName,
    Io,
}

impl BlobResponse {
    fn error(code: BlobError, description: impl ToString) -> Self {
        BlobResponse::Err {
            code,
            description: description.to_string(),
        }
    }

    fn from_io(name: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::error(BlobError::NotFound, format!("no blob '{name}'")),
            _ => Self::error(BlobError::Io, e),
        }
    }
}

impl BlobRequest {
    /// Builds the request for a shell command. Local files named by `put`
    /// are bound as raw data on `client`.
    pub fn from_command(command: Command, client: &Client) -> io::Result<Option<Self>> {
        let request = match command {
            Command::Ping => BlobRequest::Ping,
            Command::List => BlobRequest::List,
            Command::Remove { name } => BlobRequest::Remove { name },
            Command::Get { name, .. } => BlobRequest::Get { name },
            Command::Put { path, name } => {
                let file = File::open(&path)?;
                BlobRequest::Put {
                    name,
                    data: client.bind_raw_data(file),
                }
            }
            Command::Exit => return Ok(None),
        };
        Ok(Some(request))
    }
}

/// Stores each blob as a file named after it under `dir`.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Uses `dir` as is; it must already exist.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self::new(dir))
    }

    fn path(&self, name: &str) -> Result<PathBuf, BlobResponse> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if valid {
            Ok(self.dir.join(name))
        } else {
            Err(BlobResponse::error(
                BlobError::InvalidName,
                format!("invalid blob name '{name}'"),
            ))
        }
    }

    fn put(&self, name: String, mut data: RawData) -> BlobResponse {
        let path = match self.path(&name) {
            Ok(path) => path,
            Err(resp) => {
                data.close();
                return resp;
            }
        };

        let stored = File::create(&path).and_then(|mut file| io::copy(&mut data, &mut file));
        data.close();
        match stored {
            Ok(size) => {
                debug!("stored blob '{name}' ({size} bytes)");
                BlobResponse::Stored { name, size }
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                BlobResponse::error(BlobError::Io, e)
            }
        }
    }

    fn get(&self, name: String, outgoing: &RawDataScope) -> BlobResponse {
        let path = match self.path(&name) {
            Ok(path) => path,
            Err(resp) => return resp,
        };

        let opened = File::open(&path).and_then(|file| Ok((file.metadata()?.len(), file)));
        match opened {
            Ok((size, file)) => BlobResponse::Blob {
                name,
                size,
                data: outgoing.bind(file),
            },
            Err(e) => BlobResponse::from_io(&name, e),
        }
    }

    fn list(&self) -> BlobResponse {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => return BlobResponse::error(BlobError::Io, e),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        BlobResponse::Names(names)
    }

    fn remove(&self, name: String) -> BlobResponse {
        let path = match self.path(&name) {
            Ok(path) => path,
            Err(resp) => return resp,
        };

        match fs::remove_file(path) {
            Ok(()) => BlobResponse::Removed { name },
            Err(e) => BlobResponse::from_io(&name, e),
        }
    }
}

impl Responder for BlobStore {
    type Request = BlobRequest;
    type Response = BlobResponse;

    fn respond(&mut self, request: BlobRequest, outgoing: &RawDataScope) -> BlobResponse {
        match request {
            BlobRequest::Ping => BlobResponse::Pong,
            BlobRequest::Put { name, data } => self.put(name, data),
            BlobRequest::Get { name } => self.get(name, outgoing),
            BlobRequest::List => self.list(),
            BlobRequest::Remove { name } => self.remove(name),
        }
    }

    fn finalize(&mut self, peer: SocketAddr) {
        info!("blob session with {peer} finished");
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, net::Ipv4Addr, time::Duration};

    use tempdir::TempDir;

    use crate::{
        config::{ClientConfig, ServerConfig, TransferConfig},
        protocol::Server,
    };

    use super::*;

    fn store(temp: &TempDir) -> BlobStore {
        BlobStore::open(temp.path().join("blobs")).unwrap()
    }

    #[test]
    fn put_then_get_binds_file_contents() {
        let temp = TempDir::new("blob").unwrap();
        let mut store = store(&temp);
        let scope = RawDataScope::default();

        let data = RawData::from_source(Cursor::new(b"hello blob".to_vec()));
        let resp = store.respond(
            BlobRequest::Put {
                name: "greeting".to_string(),
                data,
            },
            &scope,
        );
        assert!(matches!(resp, BlobResponse::Stored { size: 10, .. }));
        assert!(scope.is_empty());

        let resp = store.respond(
            BlobRequest::Get {
                name: "greeting".to_string(),
            },
            &scope,
        );
        let BlobResponse::Blob { size, data, .. } = resp else {
            panic!("expected a blob");
        };
        assert_eq!(size, 10);
        assert_eq!(scope.ids(), vec![data.id()]);
        assert_eq!(data.read_to_vec().unwrap(), b"hello blob");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let temp = TempDir::new("blob").unwrap();
        let mut store = store(&temp);

        let resp = store.respond(
            BlobRequest::Get {
                name: "ghost".to_string(),
            },
            &RawDataScope::default(),
        );
        assert!(matches!(resp, BlobResponse::Err { code: BlobError::NotFound, .. }));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let temp = TempDir::new("blob").unwrap();
        let mut store = store(&temp);

        for name in ["", "..", "../escape", "a/b"] {
            let resp = store.respond(
                BlobRequest::Remove {
                    name: name.to_string(),
                },
                &RawDataScope::default(),
            );
            assert!(matches!(resp, BlobResponse::Err { code: BlobError::InvalidName, .. }));
        }
    }

    #[test]
    fn list_and_remove() {
        let temp = TempDir::new("blob").unwrap();
        let mut store = store(&temp);
        let scope = RawDataScope::default();

        for name in ["b", "a"] {
            store.respond(
                BlobRequest::Put {
                    name: name.to_string(),
                    data: RawData::from_source(io::empty()),
                },
                &scope,
            );
        }
        store.respond(BlobRequest::Remove { name: "b".to_string() }, &scope);

        let resp = store.respond(BlobRequest::List, &scope);
        assert!(matches!(resp, BlobResponse::Names(names) if names == vec!["a".to_string()]));
    }

    #[test]
    fn blobs_round_trip_over_the_network() {
        let temp = TempDir::new("blob").unwrap();
        let dir = temp.path().join("served");
        let transfer = TransferConfig {
            accept_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            wire_timeout: Duration::from_secs(10),
        };
        let config = ServerConfig {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            transfer,
            ..ServerConfig::default()
        };
        let server = Server::new(config, move || BlobStore::open(dir.clone()).unwrap()).unwrap();
        let addr = server.start().unwrap();

        let mut client = Client::connect(
            addr,
            ClientConfig {
                transfer,
                ..ClientConfig::default()
            },
        )
        .unwrap();

        let contents: Vec<u8> = (0..300_000u32).map(|i| (i % 199) as u8).collect();
        let data = client.bind_raw_data(Cursor::new(contents.clone()));
        let resp: BlobResponse = client
            .request(&BlobRequest::Put {
                name: "big".to_string(),
                data,
            })
            .unwrap();
        assert!(matches!(resp, BlobResponse::Stored { size, .. } if size == contents.len() as u64));

        let resp: BlobResponse = client
            .request(&BlobRequest::Get {
                name: "big".to_string(),
            })
            .unwrap();
        let BlobResponse::Blob { data, .. } = resp else {
            panic!("expected a blob");
        };
        assert_eq!(data.read_to_vec().unwrap(), contents);

        server.close();
    }
}
