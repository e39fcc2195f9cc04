use anyhow::Result;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};

use crate::inference::classify_pipeline::SequenceClassifierPipeline;
use crate::inference::models::model::ModelBase;
use crate::inference::task::batch::{
    BatchPredictHandler, BatchPredictRequest, BatchPredictResponse,
};
use crate::inference::task::predict::{PredictHandler, PredictRequest, PredictResponse};

/// The clinical assertion model: a fine-tuned BERT checkpoint with a
/// three-way sequence classification head.
pub struct AssertionBertModel {
    pub base: ModelBase,
    classifier_pipeline: SequenceClassifierPipeline,
}

impl AssertionBertModel {
    #[tracing::instrument(level = "info", skip(api))]
    pub fn new(
        api: &Api,
        base: &ModelBase,
        weights_filename: &str,
        device: &str,
        max_length: usize,
    ) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let classifier_pipeline =
            SequenceClassifierPipeline::with_hub_repo(&repo, weights_filename, device, max_length)?;

        Ok(Self {
            base: base.clone(),
            classifier_pipeline,
        })
    }
}

impl PredictHandler for AssertionBertModel {
    #[tracing::instrument(level = "info", skip(self, request))]
    fn run_predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        let (label, score) = self.classifier_pipeline.classify(&request.sentence)?;
        Ok(PredictResponse { label, score })
    }
}

impl BatchPredictHandler for AssertionBertModel {
    #[tracing::instrument(level = "info", skip(self, request))]
    fn run_predict_batch(&self, request: BatchPredictRequest) -> Result<BatchPredictResponse> {
        let results = self
            .classifier_pipeline
            .classify_batch(&request.sentences)?;
        let predictions = results
            .into_iter()
            .map(|(label, score)| PredictResponse { label, score })
            .collect();

        Ok(BatchPredictResponse { predictions })
    }
}
