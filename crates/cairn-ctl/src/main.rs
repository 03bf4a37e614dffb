//! cairn-ctl — command-line client for the Cairn gossip daemon.
//!
//! Talks the native stream protocol: push local data, fetch records,
//! switch the server's mode, rebind its interfaces. Payload compression
//! is a client-side convenience, opaque to the protocol.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use cairn_core::client::{Client, Endpoint};
use cairn_core::hwaddr::UNSET_ADDR;
use cairn_core::wire::Data;

#[derive(Parser)]
#[command(name = "cairn-ctl", about = "Client for the Cairn gossip daemon", version)]
struct Cli {
    /// Socket type for reaching the daemon.
    #[arg(short = 'p', long, default_value = "unix")]
    network: String,

    /// Socket address (unix path or host:port).
    #[arg(short = 'a', long, default_value = "/var/run/cairn.sock")]
    address: String,

    /// Network operation deadline in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Wrap payload bytes in a compression format.
    #[arg(short = 'c', long, value_enum)]
    compress: Option<Codec>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    Gzip,
    Zlib,
}

#[derive(Subcommand)]
enum Command {
    /// Set local data of a type (1-255); payload is read from stdin.
    Set { packet_type: u8 },
    /// Fetch and print all records of a type (1-255).
    Get { packet_type: u8 },
    /// Switch the server's operation mode: 0 slave, 1 master, 2 stealth master.
    Mode { mode: u8 },
    /// Rebind the server's listeners to the given interfaces.
    Interfaces { ifaces: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let endpoint = Endpoint::parse(&cli.network, &cli.address)?;
    let client = Client::new(endpoint, Duration::from_secs(cli.timeout));

    match cli.command {
        Command::Set { packet_type } => {
            if packet_type == 0 {
                bail!("type 0 is reserved for requests of all types");
            }
            let mut payload = Vec::new();
            std::io::stdin()
                .read_to_end(&mut payload)
                .context("reading data from stdin")?;
            let payload = compress(cli.compress, payload)?;
            client
                .push(vec![Data::new(UNSET_ADDR, packet_type, 0, Bytes::from(payload))])
                .await?;
        }

        Command::Get { packet_type } => {
            if packet_type == 0 {
                bail!("type 0 is reserved for requests of all types");
            }
            let records = client.request_all(packet_type).await?;
            let mut out = std::io::stdout().lock();
            for record in records {
                let payload = decompress(cli.compress, &record.payload)?;
                write!(out, "{{ \"{}\", \"", record.source)?;
                for &c in &payload {
                    match c {
                        b'\\' => out.write_all(b"\\\\")?,
                        b'"' => out.write_all(b"\\\"")?,
                        0x20..=0x7e => out.write_all(&[c])?,
                        other => write!(out, "\\x{other:02x}")?,
                    }
                }
                writeln!(out, "\" }},")?;
            }
        }

        Command::Mode { mode } => {
            if mode > 2 {
                bail!("invalid mode {mode} (0: slave, 1: master, 2: stealth master)");
            }
            client.mode_switch(mode).await?;
        }

        Command::Interfaces { ifaces } => {
            if ifaces.is_empty() {
                bail!("you need to specify interface(s)");
            }
            client.change_interfaces(&ifaces).await?;
        }
    }
    Ok(())
}

fn compress(codec: Option<Codec>, data: Vec<u8>) -> Result<Vec<u8>> {
    let Some(codec) = codec else {
        return Ok(data);
    };
    let out = Vec::new();
    Ok(match codec {
        Codec::Gzip => {
            let mut enc = GzEncoder::new(out, Compression::default());
            enc.write_all(&data)?;
            enc.finish()?
        }
        Codec::Zlib => {
            let mut enc = ZlibEncoder::new(out, Compression::default());
            enc.write_all(&data)?;
            enc.finish()?
        }
    })
}

fn decompress(codec: Option<Codec>, data: &[u8]) -> Result<Vec<u8>> {
    let Some(codec) = codec else {
        return Ok(data.to_vec());
    };
    let mut out = Vec::new();
    match codec {
        Codec::Gzip => GzDecoder::new(data).read_to_end(&mut out)?,
        Codec::Zlib => ZlibDecoder::new(data).read_to_end(&mut out)?,
    };
    Ok(out)
}
