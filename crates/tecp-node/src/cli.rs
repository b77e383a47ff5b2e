use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tecp-node: issue and verify ephemeral-computation receipts, and run the
/// transparency ledger they anchor to.
#[derive(Debug, Parser)]
#[command(name = "tecp-node", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Config file override.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate an Ed25519 signing key and print its kid.
    Keygen(KeygenArgs),

    /// Create and sign a receipt for one computation.
    Issue(IssueArgs),

    /// Verify a receipt and print the verification report.
    Verify(VerifyArgs),

    /// Transparency ledger operations.
    #[command(subcommand)]
    Log(LogCommand),
}

// -- keygen --

#[derive(Debug, Parser)]
pub struct KeygenArgs {
    /// Where to write the hex-encoded seed.
    #[arg(long)]
    pub out: PathBuf,
}

// -- issue --

#[derive(Debug, Parser)]
pub struct IssueArgs {
    /// Issuer-defined code reference, e.g. git:<hex>.
    #[arg(long)]
    pub code_ref: String,

    /// Input file (`-` for stdin).
    #[arg(long)]
    pub input: PathBuf,

    /// Output file of the computation.
    #[arg(long)]
    pub output: PathBuf,

    /// Policy id; repeatable.
    #[arg(long = "policy")]
    pub policy_ids: Vec<String>,

    /// Signing key path (falls back to config / TECP_SIGNING_KEY).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Append the receipt's leaf to the local ledger and embed the proof.
    #[arg(long)]
    pub log: bool,

    /// Where to write the receipt JSON (stdout when omitted).
    #[arg(long)]
    pub receipt_out: Option<PathBuf>,
}

// -- verify --

#[derive(Debug, Parser)]
pub struct VerifyArgs {
    /// Receipt JSON file (`-` for stdin).
    pub receipt: PathBuf,

    /// Profile override: lite or strict.
    #[arg(long)]
    pub profile: Option<String>,

    /// JWKS file with the log's public keys.
    #[arg(long)]
    pub jwks: Option<PathBuf>,
}

// -- log --

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    /// Append a leaf hash and print the inclusion proof.
    Append(LogAppendArgs),

    /// Print the inclusion proof for an appended leaf.
    Proof(LogProofArgs),

    /// Print the current signed tree head.
    Sth,

    /// Print the public entry feed.
    Entries(LogEntriesArgs),

    /// Print the log keyring as JWKS.
    Jwks,

    /// Rotate the ledger signing key: a fresh key becomes active, the old
    /// one retires, and the configured key file is replaced.
    Rotate,
}

#[derive(Debug, Parser)]
pub struct LogAppendArgs {
    /// Leaf hash, lowercase hex.
    #[arg(long)]
    pub leaf: String,
}

#[derive(Debug, Parser)]
pub struct LogProofArgs {
    /// Leaf hash, lowercase hex.
    #[arg(long)]
    pub leaf: String,
}

#[derive(Debug, Parser)]
pub struct LogEntriesArgs {
    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}
