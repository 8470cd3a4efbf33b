use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::completion::{candidate_models, openai::DEFAULT_UPSTREAM_URL};
use crate::limiter::RateLimitConfig;
use crate::persona::{DEFAULT_ASSISTANT_LABEL, DEFAULT_PERSONA};

pub const DEFAULT_ORIGIN: &str = "https://folio.example.dev";
pub const DEFAULT_TEMPERATURE: f32 = 0.35;
pub const DEFAULT_MAX_TOKENS: u32 = 500;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model_override: Option<String>,
    pub upstream_url: String,
    pub upstream_timeout_ms: Option<u64>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub persona: String,
    pub assistant_label: String,
    pub allowed_origin_prefix: String,
    pub default_origin: String,
    pub rate_limit: RateLimitConfig,
    pub max_request_bytes: usize,
    pub flavor_enabled: bool,
    pub flavor_seed: Option<u64>,
}

impl AppConfig {
    /// Defaults for everything except the upstream credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_override: None,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            upstream_timeout_ms: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            persona: DEFAULT_PERSONA.to_string(),
            assistant_label: DEFAULT_ASSISTANT_LABEL.to_string(),
            allowed_origin_prefix: DEFAULT_ORIGIN.to_string(),
            default_origin: DEFAULT_ORIGIN.to_string(),
            rate_limit: RateLimitConfig::default(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            flavor_enabled: true,
            flavor_seed: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = non_empty_var("FOLIO_API_KEY")
            .ok_or_else(|| anyhow!("FOLIO_API_KEY must be set to the upstream API key"))?;
        let mut cfg = Self::new(api_key);

        cfg.model_override = non_empty_var("FOLIO_MODEL");
        if let Some(url) = non_empty_var("FOLIO_UPSTREAM_URL") {
            cfg.upstream_url = url;
        }
        cfg.upstream_timeout_ms = parse_optional_u64("FOLIO_UPSTREAM_TIMEOUT_MS")?;
        if let Some(t) = parse_optional_f64("FOLIO_TEMPERATURE")? {
            cfg.temperature = t as f32;
        }
        if let Some(n) = parse_optional_u64("FOLIO_MAX_TOKENS")? {
            cfg.max_tokens =
                u32::try_from(n).map_err(|_| anyhow!("FOLIO_MAX_TOKENS is out of range"))?;
        }

        if let Ok(path) = env::var("FOLIO_PERSONA_FILE") {
            let persona = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read FOLIO_PERSONA_FILE '{}': file unreadable", path)
            })?;
            if persona.trim().is_empty() {
                return Err(anyhow!("FOLIO_PERSONA_FILE '{}' is empty", path));
            }
            cfg.persona = persona;
        }
        if let Some(label) = non_empty_var("FOLIO_ASSISTANT_LABEL") {
            cfg.assistant_label = label;
        }
        if let Some(prefix) = non_empty_var("FOLIO_ALLOWED_ORIGIN_PREFIX") {
            cfg.allowed_origin_prefix = prefix;
        }
        if let Some(origin) = non_empty_var("FOLIO_DEFAULT_ORIGIN") {
            cfg.default_origin = origin;
        }

        if let Some(capacity) = parse_optional_f64("FOLIO_RATE_CAPACITY")? {
            if capacity < 1.0 {
                return Err(anyhow!("FOLIO_RATE_CAPACITY must be at least 1"));
            }
            cfg.rate_limit.capacity = capacity;
        }
        if let Some(refill) = parse_optional_f64("FOLIO_RATE_REFILL_PER_MIN")? {
            if refill < 0.0 {
                return Err(anyhow!("FOLIO_RATE_REFILL_PER_MIN must not be negative"));
            }
            cfg.rate_limit.refill_per_minute = refill;
        }
        if let Some(max) = parse_optional_u64("FOLIO_RATE_MAX_CLIENTS")? {
            cfg.rate_limit.max_clients = (max as usize).max(1);
        }
        if let Some(bytes) = parse_optional_u64("FOLIO_MAX_REQUEST_BYTES")? {
            cfg.max_request_bytes = bytes as usize;
        }

        cfg.flavor_enabled = parse_bool_env("FOLIO_FLAVOR")?.unwrap_or(true);
        cfg.flavor_seed = parse_optional_u64("FOLIO_FLAVOR_SEED")?;

        Ok(cfg)
    }

    /// Ordered model candidates: the override (if any) then the defaults.
    pub fn candidate_models(&self) -> Vec<String> {
        candidate_models(self.model_override.as_deref())
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_f64(var: &str) -> Result<Option<f64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => match value.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(anyhow!("{} must be a number", var)),
        },
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
