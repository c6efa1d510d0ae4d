use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use server_api::RentalFailurePolicy;
use shared::view::SiteMetadata;
use storage::DEFAULT_MAX_CONNECTIONS;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub site_metadata_path: String,
    pub templates_glob: String,
    pub static_dir: String,
    pub rental_failure_policy: RentalFailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/catalog.db".into(),
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            site_metadata_path: "data/common.json".into(),
            templates_glob: "templates/**/*".into(),
            static_dir: "public".into(),
            rental_failure_policy: RentalFailurePolicy::default(),
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    settings_from_sources(file.as_deref(), |key| std::env::var(key).ok())
}

/// Applies `server.toml` values over the defaults, then environment
/// variables over both. Unparseable numbers and policies are ignored with a
/// warning.
pub fn settings_from_sources(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                let get = |key: &str| file_cfg.get(key).and_then(scalar_text);
                if let Some(v) = get("bind_addr") {
                    settings.server_bind = v;
                }
                if let Some(v) = get("database_url") {
                    settings.database_url = v;
                }
                if let Some(v) = get("database_max_connections") {
                    apply_max_connections(&mut settings, &v);
                }
                if let Some(v) = get("site_metadata_path") {
                    settings.site_metadata_path = v;
                }
                if let Some(v) = get("templates_glob") {
                    settings.templates_glob = v;
                }
                if let Some(v) = get("static_dir") {
                    settings.static_dir = v;
                }
                if let Some(v) = get("rental_failure_policy") {
                    apply_policy(&mut settings, &v);
                }
            }
            Err(error) => warn!(%error, "ignoring malformed server.toml"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__DATABASE_MAX_CONNECTIONS") {
        apply_max_connections(&mut settings, &v);
    }
    if let Some(v) = env("APP__SITE_METADATA_PATH") {
        settings.site_metadata_path = v;
    }
    if let Some(v) = env("APP__TEMPLATES_GLOB") {
        settings.templates_glob = v;
    }
    if let Some(v) = env("APP__STATIC_DIR") {
        settings.static_dir = v;
    }
    if let Some(v) = env("APP__RENTAL_FAILURE_POLICY") {
        apply_policy(&mut settings, &v);
    }

    settings
}

// `database_max_connections = 10` and `database_max_connections = "10"` are
// both accepted; tables and arrays are not settings.
fn scalar_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Float(v) => Some(v.to_string()),
        toml::Value::Boolean(v) => Some(v.to_string()),
        other => {
            warn!(value = %other, "ignoring non-scalar server.toml value");
            None
        }
    }
}

fn apply_max_connections(settings: &mut Settings, raw: &str) {
    match raw.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => settings.database_max_connections = parsed,
        _ => warn!(value = raw, "ignoring invalid database_max_connections"),
    }
}

fn apply_policy(settings: &mut Settings, raw: &str) {
    match raw.parse::<RentalFailurePolicy>() {
        Ok(policy) => settings.rental_failure_policy = policy,
        Err(error) => warn!(%error, "keeping default rental failure policy"),
    }
}

pub fn load_site_metadata(path: &str) -> anyhow::Result<SiteMetadata> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read site metadata '{path}'"))?;
    let site = SiteMetadata::from_json(&raw)
        .with_context(|| format!("site metadata '{path}' must be a JSON object"))?;
    if site.is_empty() {
        warn!(%path, "site metadata is empty; pages render without shared values");
    }
    Ok(site)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
