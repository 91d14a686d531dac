//! CLI type definitions
//!
//! Clap command structures that define the praktor CLI surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "praktor")]
#[command(about = "Praktor - chat gateway for containerized agent workers", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = "PRAKTOR_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway core
    Gateway,

    /// Manage vault secrets
    #[command(subcommand)]
    Vault(VaultCommands),

    /// Pack the data directory into a zstd-compressed tarball
    Backup {
        /// Destination archive (.tar.zst)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Restore the data directory from a backup tarball
    Restore {
        /// Source archive (.tar.zst)
        #[arg(short, long)]
        file: PathBuf,

        /// Replace an existing data directory
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand)]
pub enum VaultCommands {
    /// List stored secrets (names and metadata only)
    List,

    /// Create or update a secret
    Set {
        /// Secret name
        name: String,

        /// Secret value; read from stdin when omitted
        value: Option<String>,

        /// Human-readable description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Read the value from a file and store it as a file secret
        #[arg(short = 'F', long)]
        from_file: Option<PathBuf>,

        /// File name used when the secret is mounted into a worker
        #[arg(long)]
        filename: Option<String>,
    },

    /// Decrypt and print a secret value
    Get {
        name: String,
    },

    /// Delete a secret and its assignments
    Delete {
        name: String,
    },

    /// Assign a secret to an agent
    Assign {
        name: String,
        agent_id: String,
    },

    /// Remove a secret's assignment to an agent
    Unassign {
        name: String,
        agent_id: String,
    },

    /// Mark a secret as global (or clear the flag with --off)
    Global {
        name: String,

        #[arg(long)]
        off: bool,
    },
}
