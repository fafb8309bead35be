//! # RMD CLI
//!
//! Command-line utilities for inspecting replication metadata.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rmd_core::{MergeConfig, RmdRecord, RmdWithValueSchemaId, Schema};
use rmd_proto::{split_value_schema_id, RmdSerDe};
use rmd_schema::{generate_rmd_schema, InMemorySchemaRepository, StoreSchemaCache};
use serde_json::json;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CLI_STORE: &str = "cli";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config = load_config(&mut args)?;

    if args.is_empty() {
        print_help();
        return Ok(());
    }

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        command = %args[0],
        rmd_version_id = config.rmd_version_id,
        "Running command"
    );

    match args[0].as_str() {
        "rmd-schema" => {
            if args.len() < 2 {
                eprintln!("Usage: rmd rmd-schema <value-schema.json>");
                std::process::exit(1);
            }
            println!("{}", render_rmd_schema(Path::new(&args[1]), config.rmd_version_id)?);
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: rmd decode <value-schema.json|schema-dir> <base64-blob>");
                std::process::exit(1);
            }
            println!("{}", decode(Path::new(&args[1]), &args[2], &config)?);
        }
        "encode" => {
            if args.len() < 4 {
                eprintln!("Usage: rmd encode <value-schema.json|schema-dir> <value-schema-id> <rmd.json>");
                std::process::exit(1);
            }
            let value_schema_id: i32 = args[2]
                .parse()
                .with_context(|| format!("Invalid value schema id: {}", args[2]))?;
            let rmd_json = fs::read_to_string(&args[3])
                .with_context(|| format!("Failed to read {}", args[3]))?;
            println!(
                "{}",
                encode(Path::new(&args[1]), value_schema_id, &rmd_json, &config)?
            );
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

/// Take `--config <file>` out of `args`, falling back to the environment.
fn load_config(args: &mut Vec<String>) -> Result<MergeConfig> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return MergeConfig::from_env().context("Invalid configuration in environment");
    };
    let Some(path) = args.get(pos + 1).cloned() else {
        bail!("--config requires a file argument");
    };
    args.drain(pos..=pos + 1);
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
    MergeConfig::from_json(&text).with_context(|| format!("Invalid configuration in {path}"))
}

fn read_value_schema(path: &Path) -> Result<Schema> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Schema::parse_str(&text).with_context(|| format!("Invalid schema in {}", path.display()))
}

fn render_rmd_schema(path: &Path, rmd_version_id: i32) -> Result<String> {
    let value_schema = read_value_schema(path)?;
    let rmd_schema = generate_rmd_schema(&value_schema, rmd_version_id)?;
    Ok(serde_json::to_string_pretty(&rmd_schema.to_json())?)
}

/// Codec over `path`: either one value schema registered as `value_schema_id`,
/// or a directory of `<id>.avsc` files.
fn codec_for(path: &Path, value_schema_id: i32, config: &MergeConfig) -> Result<RmdSerDe> {
    let repository = InMemorySchemaRepository::new();
    if path.is_dir() {
        let count = repository
            .load_dir(CLI_STORE, path)
            .with_context(|| format!("Failed to load schemas from {}", path.display()))?;
        tracing::debug!(count, dir = %path.display(), "Loaded value schemas");
    } else {
        repository.add_value_schema(CLI_STORE, value_schema_id, read_value_schema(path)?)?;
    }
    let schema_cache = StoreSchemaCache::new(CLI_STORE, Arc::new(repository));
    Ok(RmdSerDe::new(Arc::new(schema_cache), config.rmd_version_id))
}

fn decode(path: &Path, blob: &str, config: &MergeConfig) -> Result<String> {
    let bytes = STANDARD
        .decode(blob.trim())
        .context("Blob is not valid base64")?;
    let (value_schema_id, _) = split_value_schema_id(&bytes).context("Blob is too short")?;

    let codec = codec_for(path, value_schema_id, config)?;
    let mut out = RmdWithValueSchemaId::new();
    codec
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut out)
        .context("Failed to decode RMD")?;
    let rmd = out.into_rmd_record().context("Decoder produced no RMD")?;

    Ok(serde_json::to_string_pretty(&json!({
        "value_schema_id": value_schema_id,
        "rmd": serde_json::to_value(&rmd)?,
    }))?)
}

fn encode(
    path: &Path,
    value_schema_id: i32,
    rmd_json: &str,
    config: &MergeConfig,
) -> Result<String> {
    let rmd: RmdRecord = serde_json::from_str(rmd_json).context("Invalid RMD JSON")?;
    let codec = codec_for(path, value_schema_id, config)?;
    let bytes = codec
        .serialize_value_schema_id_prepended(value_schema_id, &rmd)
        .context("Failed to encode RMD")?;
    Ok(STANDARD.encode(bytes))
}

fn print_help() {
    println!(
        r#"RMD CLI

USAGE:
    rmd [--config <file>] <COMMAND> [OPTIONS]

COMMANDS:
    rmd-schema <value-schema.json>               Print the RMD schema generated for a value schema
    decode <schema> <base64-blob>                Decode a schema-id-prefixed RMD blob to JSON
    encode <schema> <id> <rmd.json>              Encode RMD JSON into a base64 blob
    help                                         Show this help message

    <schema> is a value schema file, or a directory of <id>.avsc files

ENVIRONMENT:
    RMD_VERSION_ID, RMD_TOMBSTONE_HORIZON_MS, RMD_MAX_TOMBSTONES, RMD_CONFIG_JSON
    RUST_LOG controls log output (stderr)

EXAMPLES:
    rmd rmd-schema person.avsc
    rmd decode person.avsc AAAEvgAUAA==
    rmd decode schemas/ AAAEvgAUAA==
"#
    );
}
