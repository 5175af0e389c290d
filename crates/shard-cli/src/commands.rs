use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde_json::json;
use shard_store::layout::{QUARANTINE_DIR, TEMP_SUFFIX};
use shard_store::{
    Blob, ChunkStore, ContentId, NameId, Named, Storage, StorageConfig, BLOB_TAG, NAMED_TAG,
};
use shard_types::{Address, ChunkId, Index, SharedChunk, Timestamp};
use tracing::debug;
use walkdir::WalkDir;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    let storage = Storage::open(config).context("failed to open store")?;
    let format = cli.format;
    let result = match cli.command {
        Command::Put(args) => cmd_put(&storage, args, format),
        Command::PutBlob(args) => cmd_put_blob(&storage, args, format),
        Command::Get(args) => cmd_get(&storage, args, format),
        Command::Rm(args) => cmd_rm(&storage, args, format),
        Command::Ls(args) => cmd_ls(&storage, args, format),
        Command::Stat(_) => cmd_stat(&storage, format),
        Command::Fsck(_) => cmd_fsck(&storage, format),
    };
    storage.close().context("failed to close store")?;
    result
}

/// Configuration file (if any) with `--root` applied on top.
fn resolve_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => StorageConfig::load(path)?,
        None => StorageConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    debug!(root = %config.root.display(), "resolved configuration");
    Ok(config)
}

fn read_source(source: Source) -> anyhow::Result<Vec<u8>> {
    match (source.file, source.text) {
        (Some(path), _) => fs::read(&path).with_context(|| format!("cannot read {}", path.display())),
        (None, Some(text)) => Ok(text.into_bytes()),
        (None, None) => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf).context("cannot read standard input")?;
            Ok(buf)
        }
    }
}

fn key_id(key: &str, blob: bool) -> anyhow::Result<ChunkId> {
    if blob {
        let address = Address::from_hex(key).with_context(|| format!("invalid blob address {key}"))?;
        Ok(ChunkId::new(ContentId::new(BLOB_TAG, address)))
    } else {
        Ok(NameId::new(NAMED_TAG, key).chunk_id())
    }
}

/// Parse a hex range bound, padding a short prefix with `fill`.
fn parse_bound(text: &str, fill: char) -> anyhow::Result<Address> {
    let width = Address::BYTES * 2;
    if text.len() > width {
        bail!("address {text} is longer than {width} hex digits");
    }
    let mut padded = text.to_ascii_lowercase();
    padded.extend(std::iter::repeat(fill).take(width - text.len()));
    Address::from_hex(&padded).with_context(|| format!("invalid address {text}"))
}

fn format_time(ts: Timestamp) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Human-readable key of an identifier: the record name, or the blob address.
fn display_key(id: &ChunkId) -> String {
    match id.downcast_ref::<NameId>() {
        Some(name) => name.name().to_string(),
        None => id.address().to_hex(),
    }
}

fn index_json(index: &Index) -> serde_json::Value {
    json!({
        "key": display_key(index.id()),
        "tag": index.id().tag().0,
        "address": index.address().to_hex(),
        "updated_at": index.updated_at().as_millis(),
        "hash": index.hash().to_hex(),
    })
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_write(chunk: &SharedChunk, changed: bool, format: OutputFormat) -> anyhow::Result<()> {
    let id = chunk.id();
    match format {
        OutputFormat::Json => print_json(&json!({
            "key": display_key(&id),
            "address": id.address().to_hex(),
            "changed": changed,
        })),
        OutputFormat::Text => {
            if changed {
                println!("{} Stored {} at {}", "✓".green().bold(), display_key(&id).bold(), id.address().to_hex().cyan());
            } else {
                println!("{} {} unchanged", "=".dimmed(), display_key(&id).bold());
            }
            Ok(())
        }
    }
}

fn cmd_put(storage: &Storage, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let payload = read_source(args.source)?;
    let chunk = Named::new(NAMED_TAG, args.name, payload).shared();
    let changed = if args.force {
        storage.force_write(&chunk)?;
        true
    } else {
        storage.write(&chunk)?
    };
    report_write(&chunk, changed, format)
}

fn cmd_put_blob(storage: &Storage, args: PutBlobArgs, format: OutputFormat) -> anyhow::Result<()> {
    let data = read_source(args.source)?;
    let id = ChunkId::new(ContentId::for_content(BLOB_TAG, &data));
    // An existing blob already holds exactly these bytes.
    if storage.contains(&id)? {
        return report_write(&Blob::new(BLOB_TAG, data).shared(), false, format);
    }
    let chunk = Blob::new(BLOB_TAG, data).shared();
    let changed = storage.write(&chunk)?;
    report_write(&chunk, changed, format)
}

fn cmd_get(storage: &Storage, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = key_id(&args.key, args.blob)?;
    let Some(chunk) = storage.read(&id)? else {
        bail!("{} not found", args.key);
    };
    let payload = if let Some(named) = chunk.downcast_ref::<Named>() {
        named.payload()
    } else if let Some(blob) = chunk.downcast_ref::<Blob>() {
        blob.data()
    } else {
        bail!("{} holds an unsupported chunk kind", args.key);
    };
    match format {
        OutputFormat::Json => {
            let mut value = index_json(&chunk.index());
            value["payload"] = json!(String::from_utf8_lossy(payload));
            print_json(&value)
        }
        OutputFormat::Text => {
            io::stdout().write_all(payload)?;
            Ok(())
        }
    }
}

fn cmd_rm(storage: &Storage, args: RmArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = key_id(&args.key, args.blob)?;
    let deleted = storage.delete(&id)?;
    match format {
        OutputFormat::Json => print_json(&json!({ "key": args.key, "deleted": deleted })),
        OutputFormat::Text => {
            if deleted {
                println!("{} Deleted {}", "✓".green().bold(), args.key.bold());
            } else {
                println!("{} {} not found", "!".yellow().bold(), args.key.bold());
            }
            Ok(())
        }
    }
}

fn cmd_ls(storage: &Storage, args: LsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let min = match &args.min {
        Some(text) => parse_bound(text, '0')?,
        None => Address::MIN,
    };
    let max = match &args.max {
        Some(text) => parse_bound(text, 'f')?,
        None => Address::MAX,
    };
    let indices = storage.get_indices(&min, &max)?;
    match format {
        OutputFormat::Json => print_json(&json!(indices.values().map(index_json).collect::<Vec<_>>())),
        OutputFormat::Text => {
            for index in indices.values() {
                let kind = if index.id().tag() == BLOB_TAG { "blob " } else { "named" };
                println!(
                    "{}  {}  {}  {}",
                    index.address().short_hex().cyan(),
                    kind.dimmed(),
                    format_time(index.updated_at()),
                    display_key(index.id()).bold(),
                );
            }
            println!("{} chunk(s)", indices.len());
            Ok(())
        }
    }
}

/// Number and total size of live chunk files under `root`.
fn disk_usage(root: &Path) -> (usize, u64) {
    let mut files = 0;
    let mut bytes = 0;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != QUARANTINE_DIR);
    for entry in walker.filter_map(Result::ok) {
        let is_temp = entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX);
        if entry.file_type().is_file() && !is_temp {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (files, bytes)
}

fn cmd_stat(storage: &Storage, format: OutputFormat) -> anyhow::Result<()> {
    let shards = storage.files().shard_stats()?;
    let quarantined = storage.files().scan_quarantine()?;
    let (files, bytes) = disk_usage(storage.root());
    let layers = storage.layer_stats();
    match format {
        OutputFormat::Json => print_json(&json!({
            "config": storage.config(),
            "shards": shards,
            "files": files,
            "bytes": bytes,
            "quarantined": quarantined.len(),
            "layers": layers,
        })),
        OutputFormat::Text => {
            let config = storage.config();
            println!("Root: {}", storage.root().display().to_string().bold());
            println!("Layout: {} names, {} directory bits", config.encoding, config.directory_bits);
            println!("Chunks: {} in {} shard(s), {} bytes", files.to_string().bold(), shards.len(), bytes);
            let busiest = shards.iter().max_by_key(|(_, count)| **count);
            if let Some((name, count)) = busiest {
                println!("Largest shard: {} ({} files)", name.cyan(), count);
            }
            if quarantined.is_empty() {
                println!("Quarantine: {}", "empty".green());
            } else {
                println!("Quarantine: {}", format!("{} file(s)", quarantined.len()).red());
            }
            for layer in &layers {
                println!(
                    "  {:<6} entries {:>6}  dirty {:>4}  hits {:>6}  misses {:>6}  evictions {:>6}",
                    layer.layer, layer.entries, layer.dirty, layer.stats.hits, layer.stats.misses, layer.stats.evictions,
                );
            }
            Ok(())
        }
    }
}

fn cmd_fsck(storage: &Storage, format: OutputFormat) -> anyhow::Result<()> {
    let report = storage.fsck()?;
    match format {
        OutputFormat::Json => print_json(&json!(report)),
        OutputFormat::Text => {
            println!("Checked {} chunk file(s)", report.checked);
            for id in &report.hash_mismatches {
                println!("  {} content hash mismatch: {}", "!".yellow().bold(), id);
            }
            for path in &report.quarantined {
                println!("  {} quarantined: {}", "✗".red().bold(), path.display());
            }
            if report.is_clean() {
                println!("{} No issues.", "✓".green().bold());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn run(dir: &TempDir, args: &[&str]) -> anyhow::Result<()> {
        let root = dir.path().to_str().unwrap();
        let mut argv = vec!["shard", "--root", root];
        argv.extend_from_slice(args);
        run_command(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn put_get_rm_cycle() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["put", "greeting", "--text", "hello"]).unwrap();
        run(&dir, &["get", "greeting"]).unwrap();
        run(&dir, &["--format", "json", "ls"]).unwrap();
        run(&dir, &["rm", "greeting"]).unwrap();
        assert!(run(&dir, &["get", "greeting"]).is_err());
    }

    #[test]
    fn blob_is_addressed_by_content() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["put-blob", "--text", "payload"]).unwrap();
        let hex = ChunkId::new(ContentId::for_content(BLOB_TAG, b"payload")).address().to_hex();
        run(&dir, &["get", "--blob", &hex]).unwrap();
        assert!(run(&dir, &["get", "--blob", "zz"]).is_err());
    }

    #[test]
    fn stat_and_fsck_on_fresh_store() {
        let dir = TempDir::new().unwrap();
        run(&dir, &["put", "a", "--text", "1"]).unwrap();
        run(&dir, &["stat"]).unwrap();
        run(&dir, &["--format", "json", "fsck"]).unwrap();
        assert_eq!(disk_usage(dir.path()).0, 1);
    }

    #[test]
    fn bounds_are_padded() {
        assert_eq!(parse_bound("", '0').unwrap(), Address::MIN);
        assert_eq!(parse_bound("", 'f').unwrap(), Address::MAX);
        let (first, last) = Address::prefix_range(0xab, 8);
        assert_eq!(parse_bound("AB", '0').unwrap(), first);
        assert_eq!(parse_bound("ab", 'f').unwrap(), last);
        assert!(parse_bound(&"0".repeat(41), '0').is_err());
    }

    #[test]
    fn time_is_rendered_in_utc() {
        assert_eq!(format_time(Timestamp::from_millis(0)), "1970-01-01 00:00:00.000");
    }
}
