//! Command handlers.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use phishguard_cache::ExplanationCache;
use phishguard_runtime::{ExplainerConfig, ExplanationService, ProviderRegistry};
use serde_json::Value as JsonValue;

/// Load configuration from `path` (defaults when absent), then apply
/// environment overrides.
fn load_config(path: Option<&Path>) -> Result<ExplainerConfig> {
    let config = match path {
        Some(path) => ExplainerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ExplainerConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn parse_analysis(raw: &str) -> Result<JsonValue> {
    serde_json::from_str(raw).context("Analysis must be valid JSON")
}

async fn open_cache(path: Option<&Path>) -> Result<ExplanationCache> {
    let config = load_config(path)?;
    if !config.cache.enabled {
        bail!("Explanation cache is disabled");
    }
    let cache = ExplanationCache::open(config.cache)
        .await
        .context("Failed to open explanation cache")?;
    Ok(cache)
}

async fn service(path: Option<&Path>) -> Result<ExplanationService> {
    let config = load_config(path)?;
    let registry = ProviderRegistry::with_defaults();
    let service = ExplanationService::from_config(&config, &registry)
        .await
        .context("Failed to start explanation service")?;
    Ok(service)
}

/// Read raw header bytes. Headers need not be UTF-8.
fn read_headers(mut source: impl Read) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    source.read_to_end(&mut raw)?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        bail!("No email headers provided");
    }
    Ok(raw)
}

pub async fn explain_url(config: Option<&Path>, url: &str, analysis: &str) -> Result<()> {
    let analysis = parse_analysis(analysis)?;
    let service = service(config).await?;
    let explanation = service.explain_url(url, &analysis).await?;
    println!("{}", explanation);
    Ok(())
}

pub async fn explain_email(
    config: Option<&Path>,
    headers: Option<&Path>,
    analysis: &str,
) -> Result<()> {
    let analysis = parse_analysis(analysis)?;
    let headers = match headers {
        Some(path) => std::fs::File::open(path)
            .map_err(anyhow::Error::from)
            .and_then(read_headers)
            .with_context(|| format!("Failed to read headers from {}", path.display()))?,
        None => {
            read_headers(std::io::stdin().lock()).context("Failed to read headers from stdin")?
        }
    };

    let service = service(config).await?;
    let explanation = service.explain_email(&headers, &analysis).await?;
    println!("{}", explanation);
    Ok(())
}

pub async fn reconcile(config: Option<&Path>) -> Result<()> {
    let cache = open_cache(config).await?;
    let report = cache.reconcile().await?;
    println!(
        "scanned {} records: {} duplicates removed, {} unreadable removed, {} migrated, {} indexed",
        report.scanned,
        report.duplicates_removed.len(),
        report.unreadable_removed.len(),
        report.migrated.len(),
        report.index.len()
    );
    Ok(())
}

pub async fn evict(config: Option<&Path>) -> Result<()> {
    let cache = open_cache(config).await?;

    let expired = cache.purge_expired().await?;
    let bounded = cache.maybe_evict().await?;

    println!("{} expired records removed", expired.victims.len());
    match bounded.reason {
        Some(reason) => println!(
            "{} records removed ({} bound)",
            bounded.victims.len(),
            reason
        ),
        None => println!("store within bounds"),
    }
    Ok(())
}

pub async fn list(config: Option<&Path>, json: bool) -> Result<()> {
    let cache = open_cache(config).await?;
    let mut entries = cache.entries().await?;
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    for meta in entries {
        let identity = meta
            .identity
            .as_ref()
            .map(|i| i.as_str().to_string())
            .unwrap_or_else(|| "<unreadable>".to_string());
        if json {
            let line = serde_json::json!({
                "storage_key": meta.storage_key.as_str(),
                "identity": identity,
                "created_at": meta.created_at.to_rfc3339(),
                "size_bytes": meta.size_bytes,
            });
            println!("{}", line);
        } else {
            println!(
                "{}  {}  {:>8}  {}",
                meta.storage_key,
                meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                meta.size_bytes,
                identity
            );
        }
    }
    Ok(())
}

pub async fn stats(config: Option<&Path>) -> Result<()> {
    let cache = open_cache(config).await?;
    let summary = serde_json::json!({
        "cache_dir": cache.config().cache_dir,
        "records": cache.index_len(),
        "counters": cache.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
