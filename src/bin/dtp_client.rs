use std::{
    error::Error,
    fs::File,
    io::{self, BufWriter, Write},
    net::SocketAddr,
};

use clap::Parser;
use dtp::{
    Client, ClientConfig, Command, DtpError,
    blob::{BlobRequest, BlobResponse},
    prompt,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the blob server
    address: SocketAddr,
    /// Maximum concurrent side channel transfers
    #[arg(long, default_value_t = 4)]
    max_transfers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig {
        max_raw_data_threads: cli.max_transfers,
        ..ClientConfig::default()
    };
    let mut client = Client::connect(cli.address, config)?;

    loop {
        let command = match prompt(io::stdin().lock(), io::stdout().lock())? {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let destination = match &command {
            Command::Get { path, .. } => Some(path.clone()),
            _ => None,
        };
        let request = match BlobRequest::from_command(command, &client) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        let response: BlobResponse = match client.request(&request) {
            Ok(response) => response,
            Err(DtpError::Remote(message)) => {
                eprintln!("server error: {message}");
                continue;
            }
            Err(e) => {
                eprintln!("request failed: {e}");
                break;
            }
        };

        match response {
            BlobResponse::Pong => println!("pong"),
            BlobResponse::Stored { name, size } => println!("stored '{name}' ({size} bytes)"),
            BlobResponse::Blob {
                name,
                size,
                mut data,
            } => {
                let Some(path) = destination else {
                    eprintln!("unexpected blob '{name}'");
                    continue;
                };
                let written = File::create(&path).and_then(|file| {
                    let mut file = BufWriter::new(file);
                    let n = io::copy(&mut data, &mut file)?;
                    file.flush()?;
                    Ok(n)
                });
                match written {
                    Ok(n) if n == size => println!("saved '{name}' to {}", path.display()),
                    Ok(n) => eprintln!("'{name}' truncated: {n} of {size} bytes"),
                    Err(e) => eprintln!("failed to save '{name}': {e}"),
                }
                data.close();
            }
            BlobResponse::Names(names) => {
                for name in names {
                    println!("{name}");
                }
            }
            BlobResponse::Removed { name } => println!("removed '{name}'"),
            BlobResponse::Err { code, description } => eprintln!("{code:?}: {description}"),
        }
    }

    client.close();
    Ok(())
}
