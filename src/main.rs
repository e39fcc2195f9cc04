use std::sync::{Arc, OnceLock};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ServerResult;
use crate::inference::models::assertion_bert::AssertionBertModel;
use crate::inference::models::model::{ModelBase, ModelDomain, TextTask};
use crate::inference::task::batch::{
    BatchPredictHandler, BatchPredictRequest, BatchPredictResponse,
};
use crate::inference::task::predict::{PredictHandler, PredictRequest, PredictResponse};

mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "AssertionServer.toml")]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
struct AppState {
    model: Arc<OnceLock<AssertionBertModel>>,
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == "AssertionServer.toml" {
                Config::default().merge(args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };
    telemetry::init_telemetry(&config.otlp_endpoint, config.console);

    let state = AppState {
        model: Arc::new(OnceLock::new()),
    };
    spawn_model_loader(&config, state.model.clone());

    let router = app_router(state);
    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Downloads and loads the model on a blocking worker while the listener is
/// already accepting connections. Until the load completes the prediction
/// endpoints answer 503 and /health reports the model as not loaded. A load
/// failure takes the process down.
fn spawn_model_loader(config: &Config, slot: Arc<OnceLock<AssertionBertModel>>) {
    let base = ModelBase {
        name: "Clinical Assertion Negation BERT".into(),
        license: "MIT".into(),
        domain: ModelDomain::Text(vec![TextTask::Assertion]),
        repo_id: config.model_repo_id.clone(),
        repo_revision: config.model_revision.clone(),
    };
    let weights_filename = config.weights_filename.clone();
    let device = config.device.clone();
    let max_input_tokens = config.max_input_tokens;

    tokio::task::spawn_blocking(move || {
        let api = match Api::new() {
            Ok(api) => api,
            Err(err) => exit_err!(1, "Failed to create Hugging Face Hub API: {}", err),
        };
        match AssertionBertModel::new(&api, &base, &weights_filename, &device, max_input_tokens) {
            Ok(model) => {
                if slot.set(model).is_err() {
                    exit_err!(1, "Model slot was already initialized");
                }
                info!("Model {} loaded", base.repo_id);
            }
            Err(err) => exit_err!(1, "Failed to load model {}: {}", base.repo_id, err),
        }
    });
}

fn app_router(state: AppState) -> Router {
    // The original deployment sits behind browser frontends, allow everything.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/predict", post(handle_predict))
        .route("/predict/batch", post(handle_predict_batch))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// TODO set timeout for shutdown signal
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[axum_macros::debug_handler]
async fn handle_index() -> Json<Value> {
    Json(json!({
        "message": "Clinical Assertion Negation BERT API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "predict": "/predict",
            "predict_batch": "/predict/batch",
            "health": "/health",
        },
    }))
}

#[axum_macros::debug_handler(state = AppState)]
async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let model_loaded = state.model.get().is_some();
    let status = if model_loaded { "healthy" } else { "unhealthy" };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            model_loaded,
        }),
    )
}

#[axum_macros::debug_handler(state = AppState)]
async fn handle_predict(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> ServerResult<(StatusCode, Json<PredictResponse>)> {
    if req.sentence.is_empty() {
        bail_server!(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Field sentence must not be empty"
        );
    }
    let Some(model) = state.model.get() else {
        bail_server!(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded");
    };

    Ok((StatusCode::OK, Json(model.run_predict(req)?)))
}

#[axum_macros::debug_handler(state = AppState)]
async fn handle_predict_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchPredictRequest>,
) -> ServerResult<(StatusCode, Json<BatchPredictResponse>)> {
    if req.sentences.is_empty() {
        bail_server!(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Field sentences must not be empty"
        );
    }
    let Some(model) = state.model.get() else {
        bail_server!(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded");
    };

    Ok((StatusCode::OK, Json(model.run_predict_batch(req)?)))
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            tracing::error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, OnceLock};

    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::{app_router, AppState};

    async fn spawn_server() -> String {
        let state = AppState {
            model: Arc::new(OnceLock::new()),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app_router(state)).await.unwrap();
        });

        format!("http://{addr}")
    }

    async fn post_json(url: String, body: &'static str) -> (u16, Value) {
        let res = reqwest::Client::new()
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = res.status().as_u16();
        let body = serde_json::from_str(&res.text().await.unwrap()).unwrap_or(Value::Null);

        (status, body)
    }

    #[tokio::test]
    async fn index_lists_the_endpoints() {
        let base = spawn_server().await;

        let res = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(res.status().as_u16(), 200);

        let body: Value = serde_json::from_str(&res.text().await.unwrap()).unwrap();
        assert_eq!(body["endpoints"]["predict"], "/predict");
        assert_eq!(body["endpoints"]["predict_batch"], "/predict/batch");
        assert_eq!(body["endpoints"]["health"], "/health");
    }

    #[tokio::test]
    async fn health_reports_model_not_loaded() {
        let base = spawn_server().await;

        let res = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(res.status().as_u16(), 200);

        let body: Value = serde_json::from_str(&res.text().await.unwrap()).unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn predict_rejects_empty_sentence() {
        let base = spawn_server().await;

        let (status, body) = post_json(format!("{base}/predict"), r#"{"sentence":""}"#).await;
        assert_eq!(status, 422);
        assert!(body["error"].as_str().unwrap().contains("sentence"));
    }

    #[tokio::test]
    async fn predict_without_model_answers_unavailable() {
        let base = spawn_server().await;

        let (status, body) = post_json(
            format!("{base}/predict"),
            r#"{"sentence":"The patient denies any chest pain."}"#,
        )
        .await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "Model not loaded");
    }

    #[tokio::test]
    async fn predict_rejects_malformed_body() {
        let base = spawn_server().await;

        let (status, _) = post_json(format!("{base}/predict"), "not json").await;
        assert!((400..500).contains(&status));

        let (status, _) = post_json(format!("{base}/predict"), r#"{"text":"hi"}"#).await;
        assert!((400..500).contains(&status));
    }

    #[tokio::test]
    async fn batch_rejects_empty_list() {
        let base = spawn_server().await;

        let (status, body) =
            post_json(format!("{base}/predict/batch"), r#"{"sentences":[]}"#).await;
        assert_eq!(status, 422);
        assert!(body["error"].as_str().unwrap().contains("sentences"));
    }

    #[tokio::test]
    async fn batch_without_model_answers_unavailable() {
        let base = spawn_server().await;

        let (status, body) = post_json(
            format!("{base}/predict/batch"),
            r#"{"sentences":["No evidence of pneumonia.","Patient reports headache."]}"#,
        )
        .await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "Model not loaded");
    }
}
