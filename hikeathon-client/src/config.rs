use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

const CONFIG_FILE_NAME: &str = "config.json";
const MAX_URL_LEN: usize = 2048;
const MAX_ANON_KEY_LEN: usize = 4096;

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Supabase project URL, e.g. https://xyz.supabase.co
    #[arg(long, env = "HIKEATHON_SUPABASE_URL")]
    pub supabase_url: Option<String>,
    /// Public anon key of the Supabase project.
    #[arg(long, env = "HIKEATHON_ANON_KEY", hide_env_values = true)]
    pub anon_key: Option<String>,
    /// Directory for the durable session backup, settings, logs and saved config.
    #[arg(long, env = "HIKEATHON_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub supabase_url: Url,
    pub anon_key: String,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedClientConfig {
    pub supabase_url: String,
    pub anon_key: String,
}

impl ClientConfig {
    pub fn new(supabase_url: &str, anon_key: &str, data_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let saved = SavedClientConfig {
            supabase_url: supabase_url.to_owned(),
            anon_key: anon_key.to_owned(),
        };
        let supabase_url = validate_saved_config(&saved)?;
        Ok(Self {
            supabase_url,
            anon_key: saved.anon_key.trim().to_owned(),
            data_dir: data_dir.into(),
        })
    }

    pub fn durable_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn functions_url(&self) -> String {
        format!("{}/functions/v1", self.base_url())
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.base_url())
    }

    pub fn realtime_url(&self) -> Result<Url, String> {
        let mut url = self.supabase_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| format!("cannot derive websocket url from {}", self.supabase_url))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn base_url(&self) -> &str {
        self.supabase_url.as_str().trim_end_matches('/')
    }
}

/// Command line and environment win; the saved `config.json` fills the gaps.
/// A complete configuration coming from arguments is saved for next time.
pub fn resolve_config(args: &ConfigArgs) -> Result<ClientConfig, String> {
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);

    let saved = match load_saved_config(&data_dir) {
        Ok(saved) => saved,
        Err(err) => {
            warn!("saved config invalid: {}", err);
            None
        }
    };

    let supabase_url = args
        .supabase_url
        .clone()
        .or_else(|| saved.as_ref().map(|cfg| cfg.supabase_url.clone()))
        .unwrap_or_default();
    let anon_key = args
        .anon_key
        .clone()
        .or_else(|| saved.as_ref().map(|cfg| cfg.anon_key.clone()))
        .unwrap_or_default();

    let config = ClientConfig::new(&supabase_url, &anon_key, data_dir)?;

    let resolved = SavedClientConfig {
        supabase_url,
        anon_key,
    };
    if saved.as_ref() != Some(&resolved)
        && let Err(err) = save_saved_config(&config.data_dir, &resolved)
    {
        warn!("failed to save config: {}", err);
    }
    Ok(config)
}

pub fn validate_saved_config(cfg: &SavedClientConfig) -> Result<Url, String> {
    let mut errors: Vec<String> = Vec::new();
    let mut parsed = None;

    let supabase_url = cfg.supabase_url.trim();
    if supabase_url.is_empty() {
        errors.push("Supabase URL is required.".to_string());
    } else if supabase_url.len() > MAX_URL_LEN {
        errors.push(format!(
            "Supabase URL is too long ({} > {} chars).",
            supabase_url.len(),
            MAX_URL_LEN
        ));
    } else {
        match Url::parse(supabase_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => parsed = Some(url),
            Ok(_) => errors.push("Supabase URL must start with http:// or https://.".to_string()),
            Err(err) => errors.push(format!("Supabase URL is invalid: {err}")),
        }
    }

    let anon_key = cfg.anon_key.trim();
    if anon_key.is_empty() {
        errors.push("Anon key is required.".to_string());
    } else if anon_key.len() > MAX_ANON_KEY_LEN {
        errors.push(format!(
            "Anon key is too long ({} > {} chars).",
            anon_key.len(),
            MAX_ANON_KEY_LEN
        ));
    }

    match parsed {
        Some(url) if errors.is_empty() => Ok(url),
        _ => Err(format!(
            "Please fix the following:\n\n- {}",
            errors.join("\n- ")
        )),
    }
}

pub fn default_data_dir() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("LOCALAPPDATA").map(PathBuf::from))
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("hikeathon")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn load_saved_config(data_dir: &Path) -> Result<Option<SavedClientConfig>, String> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }

    let data = std::fs::read_to_string(&path)
        .map_err(|err| format!("failed to read config file {}: {err}", path.display()))?;

    let cfg: SavedClientConfig = serde_json::from_str(&data)
        .map_err(|err| format!("failed to parse config file {}: {err}", path.display()))?;

    validate_saved_config(&cfg)?;
    Ok(Some(cfg))
}

pub fn save_saved_config(data_dir: &Path, cfg: &SavedClientConfig) -> Result<(), String> {
    validate_saved_config(cfg)?;

    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    std::fs::create_dir_all(data_dir)
        .map_err(|err| format!("failed to create {}: {err}", data_dir.display()))?;
    let path = config_path(data_dir);
    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg).map_err(|err| err.to_string())?;

    let mut attempt = 1;
    loop {
        let result: Result<(), String> = (|| {
            std::fs::write(&tmp_path, payload.as_bytes())
                .map_err(|err| format!("failed to write {}: {err}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, &path).map_err(|err| {
                format!("failed to move config into place {}: {err}", path.display())
            })
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
