use std::env;
use std::error;

use reqwest::Url;
use serde_json::Value;

/// Probes the /health endpoint and exits non-zero unless the service is up
/// and the model has finished loading.
fn main() -> Result<(), Box<dyn error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        panic!("Missing URL argument")
    }

    let url = Url::parse(&args[1])?;

    let body = reqwest::blocking::get(url)?;
    if !body.status().is_success() {
        panic!("Request Failed!")
    }

    let health: Value = serde_json::from_str(&body.text()?)?;
    if health["model_loaded"] != Value::Bool(true) {
        panic!("Model is not loaded!")
    }

    Ok(())
}
