use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::inference::task::predict::PredictResponse;

#[derive(Deserialize, Debug)]
pub struct BatchPredictRequest {
    pub sentences: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct BatchPredictResponse {
    pub predictions: Vec<PredictResponse>,
}

pub trait BatchPredictHandler {
    fn run_predict_batch(&self, request: BatchPredictRequest)
        -> Result<BatchPredictResponse, Error>;
}
