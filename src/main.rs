#[macro_use]
extern crate rocket;

mod api;
mod app_state;
mod artifacts;
mod config;
mod engine;
mod types;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use rocket::fairing::{self, AdHoc};
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::{default_catcher, predict};
use app_state::AppState;
use config::ServiceConfig;
use engine::CandleEngine;

/// Routes, catchers and config; everything except the model itself.
pub fn build(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(AdHoc::config::<ServiceConfig>())
        .mount("/", routes![predict])
        .register("/", catchers![default_catcher])
}

/// Loads tokenizer and weights before the server binds. A failure aborts
/// launch.
async fn load_pipeline(rocket: Rocket<Build>) -> fairing::Result {
    let config: ServiceConfig = match rocket.figment().extract() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid service configuration");
            return Err(rocket);
        }
    };

    tracing::info!(
        path = %config.model_path.display(),
        max_length = config.max_length,
        max_concurrent_generations = config.max_concurrent_generations,
        "loading text generation pipeline"
    );

    let loader_config = config.clone();
    let loaded = tokio::task::spawn_blocking(move || CandleEngine::load(&loader_config)).await;

    match loaded {
        Ok(Ok(engine)) => Ok(rocket.manage(AppState::new(Arc::new(engine), &config))),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to load model");
            Err(rocket)
        }
        Err(e) => {
            tracing::error!(error = %e, "model loader panicked");
            Err(rocket)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[launch]
fn rocket() -> _ {
    dotenvy::dotenv().ok();
    init_tracing();

    build(config::figment()).attach(AdHoc::try_on_ignite("Text generation pipeline", load_pipeline))
}
