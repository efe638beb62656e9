//! # iotzone CLI
//!
//! Operator utilities for keys, publisher identities, and bus traffic.

use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

const DEFAULT_VALID_DAYS: i64 = 365;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = CliConfig::from_env()?;

    match args[1].as_str() {
        "keygen" => {
            let path = args.get(2).map_or(config.key_file.as_path(), Path::new);
            println!("{}", commands::keygen(path)?);
        }
        "pubkey" => {
            let path = args.get(2).map_or(config.key_file.as_path(), Path::new);
            print!("{}", commands::pubkey(path)?);
        }
        "attest" => {
            if args.len() < 4 {
                eprintln!("Usage: iotzone attest <publisherId> <publicKeyFile> [days]");
                std::process::exit(1);
            }
            let valid_days = match args.get(4) {
                Some(days) => days.parse().context("Invalid number of days")?,
                None => DEFAULT_VALID_DAYS,
            };
            let message = commands::attest(
                &config.key_file,
                &config.bus.client_id,
                &config.domain,
                &args[2],
                Path::new(&args[3]),
                valid_days,
            )?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        "verify" => {
            if args.len() < 4 {
                eprintln!("Usage: iotzone verify <identityFile> <issuerPublicKeyFile>");
                std::process::exit(1);
            }
            let identity = commands::verify(Path::new(&args[2]), Path::new(&args[3]))?;
            println!(
                "OK {}/{} valid until {}",
                identity.domain, identity.publisher_id, identity.valid_until
            );
        }
        "watch" => {
            if args.len() < 3 {
                eprintln!("Usage: iotzone watch <pattern>");
                std::process::exit(1);
            }
            commands::watch(&config, &args[2]).await?;
        }
        "publish" => {
            if args.len() < 4 {
                eprintln!("Usage: iotzone publish <address> <json> [--retain]");
                std::process::exit(1);
            }
            let retained = args.get(4).is_some_and(|flag| flag == "--retain");
            commands::publish(&config, &args[2], &args[3], retained).await?;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"iotzone CLI

USAGE:
    iotzone <COMMAND> [OPTIONS]

COMMANDS:
    keygen [file]                          Generate a P-256 key pair (default: $IOTZONE_KEY_FILE)
    pubkey [file]                          Print the public key of a private key file
    attest <publisherId> <pubKey> [days]   Issue a publisher identity signed with the key file
    verify <identity> <issuerPubKey>       Check an identity attestation and its expiry
    watch <pattern>                        Print decoded messages matching a pattern
    publish <address> <json> [--retain]    Publish a signed JSON message
    help                                   Show this help message

ENVIRONMENT:
    IOTZONE_MQTT_BROKER     Broker URL (default: tcp://localhost:1883)
    IOTZONE_CLIENT_ID       MQTT client id, also the issuer name of attestations
    IOTZONE_MQTT_USERNAME   Broker username
    IOTZONE_MQTT_PASSWORD   Broker password
    IOTZONE_KEY_FILE        Private key PEM (default: ./iotzone.pem)
    IOTZONE_DOMAIN          Domain of issued identities (default: default)

EXAMPLES:
    iotzone keygen
    iotzone watch "zone1/+/+/$node"
    iotzone publish "zone1/pub1/node1/$node" '{{"nodeId":"node1"}}' --retain
"#
    );
}
