use std::collections::HashSet;
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://chat.qwen.ai";
pub const DEFAULT_UPSTREAM_MODEL: &str = "qwen3-235b-a22b";

/// Where the upstream bearer token comes from. A file source is re-read
/// before every call so an external process can rotate the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Static(String),
    File(PathBuf),
}

impl CredentialSource {
    pub async fn current(&self) -> Result<String, String> {
        match self {
            CredentialSource::Static(token) => Ok(token.clone()),
            CredentialSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|s| s.trim().to_string())
                .map_err(|err| format!("token file {}: {err}", path.display())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMapEntry {
    pub logical_model: String,
    pub upstream_model: String,
}

pub fn default_model_aliases() -> Vec<ModelMapEntry> {
    [
        ("qwen", "qwen3-235b-a22b"),
        ("qwen3", "qwen3-235b-a22b"),
        ("qwen3-coder", "qwen3-coder-plus"),
        ("qwen3-moe", "qwen3-235b-a22b"),
        ("qwen3-dense", "qwen3-32b"),
        ("qwen-max", "qwen-max-latest"),
        ("qwen-plus", "qwen-plus-2025-01-25"),
        ("qwen-turbo", "qwen-turbo-2025-02-11"),
        ("qwq", "qwq-32b"),
        ("gpt-3.5-turbo", "qwen-turbo-2025-02-11"),
        ("gpt-4", "qwen-plus-2025-01-25"),
        ("gpt-4-turbo", "qwen3-235b-a22b"),
    ]
    .into_iter()
    .map(|(logical, upstream)| ModelMapEntry {
        logical_model: logical.to_string(),
        upstream_model: upstream.to_string(),
    })
    .collect()
}

/// Picks the upstream model id for a requested name.
///
/// Order: alias present in the catalog, requested id present in the catalog,
/// then the default model. An empty catalog (bootstrap skipped or failed)
/// trusts the alias or the requested name.
pub fn resolve_upstream_model(
    aliases: &[ModelMapEntry],
    requested: &str,
    catalog: &HashSet<String>,
) -> String {
    let alias = aliases
        .iter()
        .find(|entry| entry.logical_model == requested)
        .map(|entry| entry.upstream_model.as_str());
    if catalog.is_empty() {
        return alias.unwrap_or(requested).to_string();
    }
    if let Some(alias) = alias {
        if catalog.contains(alias) {
            return alias.to_string();
        }
    }
    if catalog.contains(requested) {
        return requested.to_string();
    }
    tracing::info!(
        requested,
        fallback = DEFAULT_UPSTREAM_MODEL,
        "model not found in upstream catalog, using default"
    );
    DEFAULT_UPSTREAM_MODEL.to_string()
}

pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
