use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{self, Llama, LlamaConfig};
use candle_transformers::models::quantized_llama as qllama;
use parking_lot::Mutex;
use thiserror::Error;
use tokenizers::Tokenizer;

use crate::artifacts::{
    resolve_model_dir, GenerationDefaults, LoadError, ModelArtifacts, ModelMetadata, Weights,
};
use crate::config::ServiceConfig;
use crate::types::GeneratedSequence;

/// Text-generation capability behind `/predict`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Extends `text` until the sequence holds `max_length` tokens or the
    /// model emits an end-of-sequence token. Implementations stop early once
    /// `cancel` fires.
    async fn generate(
        &self,
        text: &str,
        max_length: usize,
        cancel: &Cancellation,
    ) -> std::result::Result<Vec<GeneratedSequence>, GenerationError>;
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Inference(#[from] anyhow::Error),

    #[error("generation worker stopped: {0}")]
    Worker(String),

    #[error("generation cancelled")]
    Cancelled,
}

/// Shared stop flag, checked by the decode loop between tokens.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancels when dropped, unless disarmed first.
    pub fn guard(&self) -> CancelGuard {
        CancelGuard {
            cancel: Some(self.clone()),
        }
    }
}

pub struct CancelGuard {
    cancel: Option<Cancellation>,
}

impl CancelGuard {
    pub fn disarm(mut self) {
        self.cancel = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

// candle 0.4 sizes the llama rotary tables for this many positions
const LLAMA_CONTEXT_CEILING: usize = 4096;
const REPEAT_LAST_N: usize = 64;

const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<|endoftext|>", "<bos>"];
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<|eot_id|>", "<eos>"];

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub seed: u64,
    /// `None` means greedy decoding.
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: f32,
}

impl SamplingParams {
    /// Service overrides win, then `generation_config.json`. Without either
    /// the pipeline decodes greedily.
    pub fn resolve(config: &ServiceConfig, defaults: &GenerationDefaults) -> Self {
        let temperature = match config.temperature {
            Some(t) => Some(t),
            None if defaults.do_sample => Some(defaults.temperature.unwrap_or(1.0)),
            None => None,
        }
        .filter(|t| *t > 0.0);

        let top_p = temperature
            .and(config.top_p.or(defaults.top_p))
            .filter(|p| *p > 0.0 && *p < 1.0);

        Self {
            seed: config.seed,
            temperature,
            top_p,
            repeat_penalty: config
                .repeat_penalty
                .or(defaults.repetition_penalty)
                .unwrap_or(1.0),
        }
    }

    fn penalize(&self, logits: Tensor, tokens: &[u32]) -> candle_core::Result<Tensor> {
        if self.repeat_penalty == 1.0 {
            return Ok(logits);
        }
        let start = tokens.len().saturating_sub(REPEAT_LAST_N);
        candle_transformers::utils::apply_repeat_penalty(&logits, self.repeat_penalty, &tokens[start..])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Vec<u32>,
}

impl SpecialTokens {
    /// Looks in `generation_config.json`, then `config.json`, then falls back
    /// to well known token strings in the vocabulary.
    pub fn resolve(
        defaults: &GenerationDefaults,
        metadata: &ModelMetadata,
        lookup: impl Fn(&str) -> Option<u32>,
    ) -> Self {
        let bos = defaults
            .bos_token_id
            .as_ref()
            .or(metadata.bos_token_id.as_ref())
            .and_then(|ids| ids.first())
            .or_else(|| BOS_CANDIDATES.iter().find_map(|t| lookup(t)));

        let mut eos = defaults
            .eos_token_id
            .as_ref()
            .or(metadata.eos_token_id.as_ref())
            .map(|ids| ids.to_vec())
            .unwrap_or_default();
        if eos.is_empty() {
            eos = EOS_CANDIDATES.iter().filter_map(|t| lookup(t)).collect();
            eos.dedup();
        }

        Self { bos, eos }
    }
}

/// Number of tokens that may still be generated for a prompt of
/// `prompt_len` tokens.
pub fn token_budget(prompt_len: usize, max_length: usize, context_len: usize) -> usize {
    max_length.min(context_len).saturating_sub(prompt_len)
}

/// Builds the returned text the way transformers pipelines do: the caller's
/// own text followed by whatever the decoded sequence adds past the decoded
/// prompt.
pub fn splice_continuation(original: &str, prompt_decoded: &str, full_decoded: &str) -> String {
    let continuation = full_decoded
        .strip_prefix(prompt_decoded)
        .or_else(|| full_decoded.get(prompt_decoded.len()..))
        .unwrap_or("");
    format!("{original}{continuation}")
}

enum Architecture {
    Llama {
        model: Llama,
        config: llama::Config,
        dtype: DType,
    },
    Quantized(qllama::ModelWeights),
}

/// Per-request view of the model, owning the kv cache where the architecture
/// keeps it outside the weights.
enum Decoder<'a> {
    Llama { model: &'a Llama, cache: llama::Cache },
    Quantized(&'a mut qllama::ModelWeights),
}

impl Architecture {
    fn decoder(&mut self, device: &Device) -> candle_core::Result<Decoder<'_>> {
        Ok(match self {
            Architecture::Llama { model, config, dtype } => Decoder::Llama {
                model,
                cache: llama::Cache::new(true, *dtype, config, device)?,
            },
            // index_pos 0 resets the quantized model's internal cache
            Architecture::Quantized(weights) => Decoder::Quantized(weights),
        })
    }
}

impl Decoder<'_> {
    /// Logits for the last position, as a rank-1 f32 tensor.
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        let logits = match self {
            Decoder::Llama { model, cache } => model.forward(input, index_pos, cache)?,
            Decoder::Quantized(weights) => weights.forward(input, index_pos)?,
        };
        logits.squeeze(0)?.to_dtype(DType::F32)
    }
}

struct Pipeline {
    model: Mutex<Architecture>,
    tokenizer: Tokenizer,
    device: Device,
    sampling: SamplingParams,
    special: SpecialTokens,
    context_len: usize,
}

/// Token ids of one generation: the prompt as fed to the model, and the
/// prompt followed by everything sampled after it.
struct TokenRun {
    prompt: Vec<u32>,
    tokens: Vec<u32>,
}

impl Pipeline {
    fn run(&self, text: &str, max_length: usize, cancel: &Cancellation) -> Result<GeneratedSequence> {
        let Some(TokenRun { prompt, tokens }) = self.generate_ids(text, max_length, cancel)? else {
            return Ok(GeneratedSequence {
                generated_text: text.to_string(),
            });
        };

        let prompt_decoded = self
            .tokenizer
            .decode(&prompt, true)
            .map_err(|e| anyhow!("failed to decode prompt: {e}"))?;
        let full_decoded = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("failed to decode output: {e}"))?;

        tracing::debug!(new_tokens = tokens.len() - prompt.len(), "generation finished");

        Ok(GeneratedSequence {
            generated_text: splice_continuation(text, &prompt_decoded, &full_decoded),
        })
    }

    /// `None` when there is nothing to generate: an empty prompt without a
    /// bos token, or a prompt already at `max_length`.
    fn generate_ids(
        &self,
        text: &str,
        max_length: usize,
        cancel: &Cancellation,
    ) -> Result<Option<TokenRun>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("failed to encode prompt: {e}"))?;
        let mut prompt = encoding.get_ids().to_vec();
        if prompt.is_empty() {
            match self.special.bos {
                Some(bos) => prompt.push(bos),
                None => return Ok(None),
            }
        }

        let budget = token_budget(prompt.len(), max_length, self.context_len);
        tracing::debug!(prompt_tokens = prompt.len(), budget, "starting generation");
        if budget == 0 {
            return Ok(None);
        }

        let mut tokens = prompt.clone();
        let mut processor = LogitsProcessor::new(
            self.sampling.seed,
            self.sampling.temperature,
            self.sampling.top_p,
        );

        {
            let mut model = self.model.lock();
            let mut decoder = model.decoder(&self.device)?;
            let mut index_pos = 0;

            for step in 0..budget {
                if cancel.is_cancelled() {
                    tracing::debug!(step, "generation cancelled");
                    break;
                }
                // first step runs the whole prompt, later ones reuse the kv cache
                let context = if step == 0 {
                    &tokens[..]
                } else {
                    &tokens[tokens.len() - 1..]
                };
                let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
                let logits = decoder.forward(&input, index_pos)?;
                index_pos += context.len();

                let logits = self.sampling.penalize(logits, &tokens)?;
                let next = processor.sample(&logits)?;
                tokens.push(next);
                if self.special.eos.contains(&next) {
                    break;
                }
            }
        }

        Ok(Some(TokenRun { prompt, tokens }))
    }
}

/// Candle-backed generator for llama-family checkpoints (safetensors) and
/// quantized GGUF files.
pub struct CandleEngine {
    pipeline: Arc<Pipeline>,
}

impl CandleEngine {
    /// Loads tokenizer and weights. Blocking; call it off the async runtime.
    pub fn load(config: &ServiceConfig) -> std::result::Result<Self, LoadError> {
        let start = Instant::now();

        let dir = resolve_model_dir(&config.model_path, config.model_repo.as_deref())?;
        let artifacts = ModelArtifacts::discover(&dir)?;
        let metadata = artifacts.metadata()?;
        let defaults = artifacts.generation_defaults()?;

        if let Weights::Safetensors(_) = artifacts.weights {
            let model_type = metadata.model_type.as_deref().unwrap_or("llama");
            if !matches!(model_type, "llama" | "mistral") {
                return Err(LoadError::UnsupportedArchitecture(model_type.to_string()));
            }
        }

        let device = select_device(config.gpu).map_err(|e| LoadError::Model(e.into()))?;
        let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
            .map_err(|e| LoadError::Model(anyhow!("failed to load tokenizer: {e}")))?;

        let weight_bytes = artifacts.weights.size_on_disk()?;
        let (model, context_len) = match &artifacts.weights {
            Weights::Safetensors(shards) => {
                load_llama(&artifacts, shards, &metadata, &device).map_err(LoadError::Model)?
            }
            Weights::Gguf(path) => load_gguf(path, &device).map_err(LoadError::Model)?,
        };

        let special = SpecialTokens::resolve(&defaults, &metadata, |t| tokenizer.token_to_id(t));
        let sampling = SamplingParams::resolve(config, &defaults);

        tracing::info!(
            path = %artifacts.dir.display(),
            device = ?device,
            weights = %human_size(weight_bytes),
            context_len,
            eos = ?special.eos,
            greedy = sampling.temperature.is_none(),
            "model loaded in {:.2}s",
            start.elapsed().as_secs_f32(),
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                model: Mutex::new(model),
                tokenizer,
                device,
                sampling,
                special,
                context_len,
            }),
        })
    }
}

#[async_trait]
impl TextGenerator for CandleEngine {
    async fn generate(
        &self,
        text: &str,
        max_length: usize,
        cancel: &Cancellation,
    ) -> std::result::Result<Vec<GeneratedSequence>, GenerationError> {
        let pipeline = Arc::clone(&self.pipeline);
        let text = text.to_owned();
        let worker_cancel = cancel.clone();

        let sequence =
            tokio::task::spawn_blocking(move || pipeline.run(&text, max_length, &worker_cancel))
                .await
                .map_err(|e| GenerationError::Worker(e.to_string()))??;

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        Ok(vec![sequence])
    }
}

fn select_device(gpu: Option<usize>) -> candle_core::Result<Device> {
    match gpu {
        Some(ordinal) => Device::cuda_if_available(ordinal),
        None => Ok(Device::Cpu),
    }
}

fn load_llama(
    artifacts: &ModelArtifacts,
    shards: &[std::path::PathBuf],
    metadata: &ModelMetadata,
    device: &Device,
) -> Result<(Architecture, usize)> {
    let config_path = artifacts
        .config
        .as_ref()
        .ok_or_else(|| anyhow!("config.json is required for safetensors weights"))?;
    let config: LlamaConfig = serde_json::from_slice(&fs::read(config_path)?)?;
    let config = config.into_config(false);

    let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(shards, dtype, device)? };
    let model = Llama::load(vb, &config)?;

    let context_len = metadata
        .max_position_embeddings
        .unwrap_or(LLAMA_CONTEXT_CEILING)
        .min(LLAMA_CONTEXT_CEILING);

    Ok((
        Architecture::Llama {
            model,
            config,
            dtype,
        },
        context_len,
    ))
}

fn load_gguf(path: &std::path::Path, device: &Device) -> Result<(Architecture, usize)> {
    let mut file = fs::File::open(path)?;
    let content = gguf_file::Content::read(&mut file).map_err(|e| e.with_path(path))?;
    tracing::debug!(tensors = content.tensor_infos.len(), "read gguf header");

    let model = qllama::ModelWeights::from_gguf(content, &mut file, device)?;
    Ok((Architecture::Quantized(model), qllama::MAX_SEQ_LEN))
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
