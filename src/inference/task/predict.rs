use anyhow::Error;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
pub struct PredictRequest {
    pub sentence: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct PredictResponse {
    pub label: String,
    pub score: f32,
}

pub trait PredictHandler {
    fn run_predict(&self, request: PredictRequest) -> Result<PredictResponse, Error>;
}
