use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_PATH: &str = "/app/modelo_local";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_LENGTH: usize = 50;

/// Service settings. They sit in the same figment as Rocket's own `address`
/// and `port`, so `Rocket.toml` and `ROCKET_*` variables configure both, e.g.
/// `ROCKET_MODEL_PATH=/models/tiny-llama`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding `tokenizer.json` and the weights.
    pub model_path: PathBuf,
    /// Hub repo to fetch into the local cache when `model_path` is missing.
    pub model_repo: Option<String>,
    /// Ceiling on prompt plus generated tokens.
    pub max_length: usize,
    pub max_concurrent_generations: usize,
    /// `0` disables the timeout.
    pub generation_timeout_ms: u64,
    pub seed: u64,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<f32>,
    /// CUDA ordinal. Falls back to the CPU when CUDA is not available.
    pub gpu: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            model_repo: None,
            max_length: DEFAULT_MAX_LENGTH,
            max_concurrent_generations: 1,
            generation_timeout_ms: 120_000,
            seed: 42,
            temperature: None,
            top_p: None,
            repeat_penalty: None,
            gpu: None,
        }
    }
}

impl ServiceConfig {
    pub fn generation_timeout(&self) -> Option<Duration> {
        (self.generation_timeout_ms > 0).then(|| Duration::from_millis(self.generation_timeout_ms))
    }
}

/// Rocket's figment with this service's defaults slotted in below
/// `Rocket.toml` and the environment.
pub fn figment() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(Serialized::defaults(ServiceConfig::default()))
        .merge(Serialized::default("address", Ipv4Addr::UNSPECIFIED))
        .merge(Serialized::default("port", DEFAULT_PORT))
        .merge(Toml::file(Env::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(Env::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
}
