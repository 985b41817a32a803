// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

// Broadcast key generation tool for IMA agent nodes

use anyhow::Result;
use clap::{Parser, Subcommand};
use fastcrypto::traits::{KeyPair, ToFromBytes};
use ima_agent_keys::{keygen, keypair_file::read_key, to_eth_address};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen")]
#[command(about = "Generate secp256k1 broadcast keys for IMA agent nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a node broadcast key
    Generate {
        /// Output file path for the generated key
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Examine an existing key file
    Examine {
        /// Path to the key file to examine
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate { output } => {
            println!("Generating broadcast key (secp256k1)...");
            keygen::generate_broadcast_key_and_write_to_file(&output)?;
            println!("  File: {:?}", output);
            examine_key_file(&output)?;
            println!("\nAdd the public key to the `broadcast-public-key` of this node in every peer's `nodes` list.");
        }
        Commands::Examine { path } => {
            println!("Examining key file: {:?}", path);
            examine_key_file(&path)?;
        }
    }

    Ok(())
}

fn examine_key_file(path: &PathBuf) -> Result<()> {
    let kp = read_key(path)?;
    println!("Public key (hex): {}", hex::encode(kp.public().as_bytes()));
    println!("Ethereum address: {:?}", to_eth_address(kp.public())?);
    Ok(())
}
