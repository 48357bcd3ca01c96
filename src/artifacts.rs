use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use serde::Deserialize;
use thiserror::Error;

/// Startup failures. Any of these stops the server before it binds.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model path `{0}` does not exist")]
    MissingPath(PathBuf),

    #[error("model path `{0}` is not a directory")]
    NotADirectory(PathBuf),

    #[error("`{file}` not found in `{dir}`")]
    MissingFile { dir: PathBuf, file: &'static str },

    #[error("no weights in `{0}`: expected model.safetensors, model.safetensors.index.json or a single .gguf file")]
    MissingWeights(PathBuf),

    #[error("`{0}` holds more than one .gguf file")]
    AmbiguousWeights(PathBuf),

    #[error("unsupported model_type `{0}` (supported: llama, mistral, gguf)")]
    UnsupportedArchitecture(String),

    #[error("invalid `{file}`: {source}")]
    InvalidJson {
        file: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to fetch `{repo}` from the hub: {source}")]
    Download {
        repo: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to load model: {0}")]
    Model(#[source] anyhow::Error),
}

/// Token id fields in Hugging Face configs are either a single id or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }

    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::One(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }
}

/// The handful of `config.json` fields the server reads itself. The full file
/// is parsed again by the architecture loader.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
}

/// `generation_config.json`, when the checkpoint ships one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Weights {
    Safetensors(Vec<PathBuf>),
    Gguf(PathBuf),
}

impl Weights {
    pub fn files(&self) -> &[PathBuf] {
        match self {
            Weights::Safetensors(shards) => shards,
            Weights::Gguf(path) => std::slice::from_ref(path),
        }
    }

    /// Combined size of the weight files.
    pub fn size_on_disk(&self) -> std::io::Result<u64> {
        self.files()
            .iter()
            .try_fold(0, |total, path| Ok(total + fs::metadata(path)?.len()))
    }
}

/// A model directory after discovery: every file the loader needs, checked to
/// exist.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub dir: PathBuf,
    pub tokenizer: PathBuf,
    pub config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    pub weights: Weights,
}

const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

impl ModelArtifacts {
    /// Inspects `dir` and works out which files make up the checkpoint.
    pub fn discover(dir: &Path) -> Result<Self, LoadError> {
        if !dir.exists() {
            return Err(LoadError::MissingPath(dir.to_path_buf()));
        }
        if !dir.is_dir() {
            return Err(LoadError::NotADirectory(dir.to_path_buf()));
        }

        let tokenizer = dir.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(LoadError::MissingFile {
                dir: dir.to_path_buf(),
                file: TOKENIZER_FILE,
            });
        }

        let config = Some(dir.join(CONFIG_FILE)).filter(|p| p.is_file());
        let generation_config = Some(dir.join(GENERATION_CONFIG_FILE)).filter(|p| p.is_file());

        let weights = find_weights(dir)?;
        if matches!(weights, Weights::Safetensors(_)) && config.is_none() {
            return Err(LoadError::MissingFile {
                dir: dir.to_path_buf(),
                file: CONFIG_FILE,
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            tokenizer,
            config,
            generation_config,
            weights,
        })
    }

    pub fn metadata(&self) -> Result<ModelMetadata, LoadError> {
        match &self.config {
            Some(path) => read_json(path),
            None => Ok(ModelMetadata::default()),
        }
    }

    pub fn generation_defaults(&self) -> Result<GenerationDefaults, LoadError> {
        match &self.generation_config {
            Some(path) => read_json(path),
            None => Ok(GenerationDefaults::default()),
        }
    }
}

fn find_weights(dir: &Path) -> Result<Weights, LoadError> {
    let single = dir.join(SAFETENSORS_FILE);
    if single.is_file() {
        return Ok(Weights::Safetensors(vec![single]));
    }

    let index = dir.join(SAFETENSORS_INDEX_FILE);
    if index.is_file() {
        return Ok(Weights::Safetensors(shards_from_index(dir, &index)?));
    }

    let mut ggufs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "gguf") {
            ggufs.push(path);
        }
    }
    match ggufs.len() {
        0 => Err(LoadError::MissingWeights(dir.to_path_buf())),
        1 => Ok(Weights::Gguf(ggufs.remove(0))),
        _ => Err(LoadError::AmbiguousWeights(dir.to_path_buf())),
    }
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

fn shards_from_index(dir: &Path, index: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let index: SafetensorsIndex = read_json(index)?;
    let mut shards: Vec<String> = index.weight_map.into_values().collect();
    shards.sort();
    shards.dedup();

    shards
        .into_iter()
        .map(|file| {
            let path = dir.join(&file);
            if path.is_file() {
                Ok(path)
            } else {
                Err(LoadError::MissingWeights(path))
            }
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| LoadError::InvalidJson {
        file: path.to_path_buf(),
        source,
    })
}

/// Returns the directory to load from. A missing `model_path` is only
/// recoverable when a hub repo is configured, in which case the snapshot is
/// downloaded into the hf-hub cache.
pub fn resolve_model_dir(model_path: &Path, model_repo: Option<&str>) -> Result<PathBuf, LoadError> {
    if model_path.exists() {
        return Ok(model_path.to_path_buf());
    }
    let Some(repo) = model_repo else {
        return Err(LoadError::MissingPath(model_path.to_path_buf()));
    };

    tracing::info!(repo, path = %model_path.display(), "model path missing, fetching from hub");
    download_snapshot(repo).map_err(|source| LoadError::Download {
        repo: repo.to_string(),
        source,
    })
}

fn download_snapshot(repo: &str) -> anyhow::Result<PathBuf> {
    let api = Api::new()?;
    let api = api.model(repo.to_string());

    let tokenizer = api.get(TOKENIZER_FILE)?;
    // optional files; absent ones are simply skipped
    for file in [CONFIG_FILE, GENERATION_CONFIG_FILE] {
        if let Err(e) = api.get(file) {
            tracing::debug!(file, error = %e, "optional file not fetched");
        }
    }

    match api.get(SAFETENSORS_FILE) {
        Ok(_) => {}
        Err(_) => {
            let index = api.get(SAFETENSORS_INDEX_FILE)?;
            let index: SafetensorsIndex = serde_json::from_slice(&fs::read(index)?)?;
            let mut shards: Vec<String> = index.weight_map.into_values().collect();
            shards.sort();
            shards.dedup();
            for shard in shards {
                api.get(&shard)?;
            }
        }
    }

    tokenizer
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("hub cache returned a path without parent"))
}
