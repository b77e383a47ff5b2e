mod cli;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use tecp_node::api::log_routes;
use tecp_node::config::Config;
use tecp_node::keyring::{derive_kid, Keyring};
use tecp_node::ledger::service::{self, LedgerHandle};
use tecp_node::ledger::store::{EntryMetadata, FileStore};
use tecp_node::ledger::TransparencyLedger;
use tecp_node::observability::init_tracing;
use tecp_node::policy::PolicyRuntime;
use tecp_node::receipt::issuer::{attach_inclusion, CreateParams, ReceiptIssuer};
use tecp_node::receipt::signer::{generate_signing_key, load_signing_key, store_signing_key};
use tecp_node::verify::profile::Profile;
use tecp_node::verify::Verifier;

use cli::{Cli, Command, IssueArgs, KeygenArgs, LogCommand, VerifyArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.observability);

    match cli.command {
        Command::Keygen(args) => keygen(&args),
        Command::Issue(args) => issue(&config, &args).await,
        Command::Verify(args) => verify(&config, &args),
        Command::Log(command) => log_command(&config, command).await,
    }
}

fn keygen(args: &KeygenArgs) -> Result<()> {
    let key = generate_signing_key();
    store_signing_key(&args.out, &key)
        .with_context(|| format!("writing key to {}", args.out.display()))?;
    println!(
        "{}",
        serde_json::json!({
            "kid": derive_kid(&key.verifying_key()),
            "pubkey": tecp_node::encoding::b64url(key.verifying_key().as_bytes()),
            "path": args.out.display().to_string(),
        })
    );
    Ok(())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buffer = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buffer)
            .context("reading stdin")?;
        Ok(buffer)
    } else {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    }
}

async fn issue(config: &Config, args: &IssueArgs) -> Result<()> {
    let key_path: PathBuf = args
        .key
        .clone()
        .or_else(|| config.issuer.signing_key_path.clone())
        .context("no signing key: pass --key or set issuer.signing_key_path / TECP_SIGNING_KEY")?;
    let signing_key = load_signing_key(&key_path)?;

    let input = read_bytes(&args.input)?;
    let output = read_bytes(&args.output)?;

    let issuer = ReceiptIssuer::new(signing_key, PolicyRuntime::with_builtins(), config.profile);
    let params = CreateParams::new(&args.code_ref, &input, &output)
        .with_policies(args.policy_ids.iter().cloned());
    let mut full = issuer
        .create(params)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("creating receipt")?;

    if args.log {
        let handle = open_ledger_handle(config)?;
        let leaf = full.leaf().map_err(|e| anyhow::anyhow!("{e}"))?;
        let metadata = EntryMetadata {
            policy_ids: Some(full.receipt.policy_ids.clone()),
            kid: None,
        };
        let outcome = handle
            .append(leaf, metadata)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("appending to ledger")?;
        attach_inclusion(&mut full, &outcome.proof);
        tracing::info!(seq = outcome.seq, "receipt anchored in ledger");
    }

    let json = serde_json::to_string_pretty(&full).context("serializing receipt")?;
    match &args.receipt_out {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing receipt to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn verify(config: &Config, args: &VerifyArgs) -> Result<()> {
    let profile = match &args.profile {
        Some(text) => text.parse::<Profile>().map_err(|e| anyhow::anyhow!(e))?,
        None => config.profile,
    };

    let log_keys = match &args.jwks {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let jwks = serde_json::from_str(&text).context("parsing JWKS")?;
            Some(Keyring::from_jwks(&jwks).map_err(|e| anyhow::anyhow!("{e}"))?)
        }
        None => None,
    };

    let text = String::from_utf8(read_bytes(&args.receipt)?).context("receipt is not UTF-8")?;
    let policies = PolicyRuntime::with_builtins();
    let mut verifier = Verifier::new(profile, &policies);
    if let Some(keys) = &log_keys {
        verifier = verifier.with_log_keys(keys);
    }

    let report = verifier.verify_json(&text, chrono::Utc::now().timestamp_millis());
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );
    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn open_ledger(config: &Config) -> Result<TransparencyLedger<FileStore>> {
    let data_dir = &config.ledger.data_dir;
    let key_path = config.ledger.signing_key_path();

    let signing_key = if key_path.exists() {
        load_signing_key(&key_path)?
    } else {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        let key = generate_signing_key();
        store_signing_key(&key_path, &key)?;
        tracing::info!(path = %key_path.display(), "generated ledger signing key");
        key
    };

    let store = FileStore::open(data_dir).map_err(|e| anyhow::anyhow!("{e}"))?;
    let seed_ring = Keyring::with_active_key(&signing_key.verifying_key(), 0);
    TransparencyLedger::open(
        store,
        signing_key,
        seed_ring,
        chrono::Utc::now().timestamp_millis(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))
    .context("opening ledger")
}

fn open_ledger_handle(config: &Config) -> Result<LedgerHandle> {
    Ok(service::spawn(open_ledger(config)?))
}

async fn log_command(config: &Config, command: LogCommand) -> Result<()> {
    match command {
        LogCommand::Append(args) => {
            let mut ledger = open_ledger(config)?;
            let request = log_routes::PostEntryRequest {
                leaf: args.leaf,
                metadata: EntryMetadata::default(),
            };
            let response = log_routes::post_entry(
                &mut ledger,
                &request,
                chrono::Utc::now().timestamp_millis(),
            )
            .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.error))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        LogCommand::Proof(args) => {
            let ledger = open_ledger(config)?;
            let response = log_routes::get_proof(&ledger, &args.leaf)
                .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.error))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        LogCommand::Sth => {
            let ledger = open_ledger(config)?;
            println!("{}", serde_json::to_string_pretty(&log_routes::get_sth(&ledger))?);
        }

        LogCommand::Entries(args) => {
            let ledger = open_ledger(config)?;
            let feed = log_routes::list_entries(&ledger, args.offset, args.limit);
            println!("{}", serde_json::to_string_pretty(&feed)?);
        }

        LogCommand::Jwks => {
            let ledger = open_ledger(config)?;
            println!("{}", serde_json::to_string_pretty(&log_routes::get_jwks(&ledger))?);
        }

        LogCommand::Rotate => {
            let mut ledger = open_ledger(config)?;
            let new_key = generate_signing_key();
            let sth = ledger
                .rotate_signing_key(new_key.clone(), chrono::Utc::now().timestamp_millis())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let key_path = config.ledger.signing_key_path();
            store_signing_key(&key_path, &new_key)?;
            eprintln!("rotated ledger key; new kid: {}", sth.kid);
            println!("{}", serde_json::to_string_pretty(&sth)?);
        }
    }

    Ok(())
}
