//! In-process doubles for exercising the HTTP layer, and a tiny on-disk
//! model for exercising the real engine.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama::{Llama, LlamaConfig};
use parking_lot::Mutex;
use rocket::{Build, Rocket};

use crate::app_state::AppState;
use crate::config::{self, ServiceConfig};
use crate::engine::{Cancellation, GenerationError, TextGenerator};
use crate::types::GeneratedSequence;

enum Reply {
    Echo,
    Canned(Vec<String>),
    Fail,
}

enum Work {
    /// Sleeps on the runtime.
    Async(Duration),
    /// Occupies a blocking-pool thread, like a decode loop does.
    Blocking { duration: Duration, cancellable: bool },
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Counters {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records every call and answers like a tiny deterministic model.
pub struct StubGenerator {
    reply: Reply,
    work: Option<Work>,
    calls: Mutex<Vec<(String, usize)>>,
    counters: Arc<Counters>,
}

impl StubGenerator {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            work: None,
            calls: Mutex::new(Vec::new()),
            counters: Arc::default(),
        }
    }

    /// Answers `"<text> world"`.
    pub fn echo() -> Self {
        Self::new(Reply::Echo)
    }

    pub fn canned(texts: Vec<&str>) -> Self {
        Self::new(Reply::Canned(texts.into_iter().map(String::from).collect()))
    }

    pub fn failing() -> Self {
        Self::new(Reply::Fail)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.work = Some(Work::Async(delay));
        self
    }

    /// Blocks a worker thread for `duration`, ignoring cancellation.
    pub fn with_blocking_work(mut self, duration: Duration) -> Self {
        self.work = Some(Work::Blocking {
            duration,
            cancellable: false,
        });
        self
    }

    /// Blocks a worker thread for up to `duration`, stopping once cancelled.
    pub fn with_cancellable_work(mut self, duration: Duration) -> Self {
        self.work = Some(Work::Blocking {
            duration,
            cancellable: true,
        });
        self
    }

    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancelled_runs(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(
        &self,
        text: &str,
        max_length: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<GeneratedSequence>, GenerationError> {
        self.calls.lock().push((text.to_string(), max_length));

        match &self.work {
            None => {
                self.counters.enter();
                self.counters.leave();
            }
            Some(Work::Async(delay)) => {
                self.counters.enter();
                tokio::time::sleep(*delay).await;
                self.counters.leave();
            }
            Some(Work::Blocking {
                duration,
                cancellable,
            }) => {
                let (duration, cancellable) = (*duration, *cancellable);
                let counters = Arc::clone(&self.counters);
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    counters.enter();
                    let deadline = Instant::now() + duration;
                    while Instant::now() < deadline {
                        if cancellable && cancel.is_cancelled() {
                            counters.cancelled.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    counters.leave();
                })
                .await
                .map_err(|e| GenerationError::Worker(e.to_string()))?;
            }
        }

        match &self.reply {
            Reply::Echo => Ok(vec![GeneratedSequence {
                generated_text: format!("{text} world"),
            }]),
            Reply::Canned(texts) => Ok(texts
                .iter()
                .map(|t| GeneratedSequence {
                    generated_text: t.clone(),
                })
                .collect()),
            Reply::Fail => Err(GenerationError::Inference(anyhow::anyhow!(
                "CUDA_ERROR_OUT_OF_MEMORY at layer 17"
            ))),
        }
    }
}

/// The production rocket with `stub` in place of the candle engine.
pub fn test_rocket(stub: Arc<StubGenerator>, config: ServiceConfig) -> Rocket<Build> {
    let state = AppState::new(stub, &config);
    crate::build(config::figment().merge(rocket::figment::providers::Serialized::defaults(config)))
        .manage(state)
}

const TINY_VOCAB: [&str; 16] = [
    "<unk>", "<s>", "</s>", "the", "cat", "sat", "on", "mat", "a", "dog", "ran", "to", "park",
    "and", "hello", "world",
];

/// Writes a randomly initialised one-layer llama plus a word-level tokenizer
/// into `dir`, in the layout `ModelArtifacts::discover` expects.
pub fn write_tiny_llama(dir: &Path) -> anyhow::Result<()> {
    let config = serde_json::json!({
        "model_type": "llama",
        "hidden_size": 16,
        "intermediate_size": 32,
        "vocab_size": TINY_VOCAB.len(),
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 64,
        "bos_token_id": 1,
        "eos_token_id": 2,
    });
    fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config)?)?;

    let llama_config: LlamaConfig = serde_json::from_value(config)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    Llama::load(vb, &llama_config.into_config(false))?;
    varmap.save(dir.join("model.safetensors"))?;

    let vocab: serde_json::Map<String, serde_json::Value> = TINY_VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), id.into()))
        .collect();
    let special = |id: usize| {
        serde_json::json!({
            "id": id,
            "content": TINY_VOCAB[id],
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true,
        })
    };
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0), special(1), special(2)],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" },
    });
    fs::write(dir.join("tokenizer.json"), serde_json::to_vec(&tokenizer)?)?;
    Ok(())
}
