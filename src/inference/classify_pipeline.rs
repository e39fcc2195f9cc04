use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::ApiRepo;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{Tokenizer, TruncationDirection};

use crate::inference::labels::LabelMap;

// Taken from
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/bert/main.rs
pub struct SequenceClassifierPipeline {
    backbone: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    labels: LabelMap,
    max_length: usize,
}

impl SequenceClassifierPipeline {
    /// Loads the full classifier from a Hugging Face repository: config,
    /// weights, tokenizer, BERT backbone, pooler and classification head.
    #[tracing::instrument(level = "info", skip(repo))]
    pub fn with_hub_repo(
        repo: &ApiRepo,
        weights_filename: &str,
        device: &str,
        max_length: usize,
    ) -> Result<SequenceClassifierPipeline> {
        let config_file = repo.get("config.json")?;
        let raw_config = std::fs::read_to_string(config_file)?;
        let bert_config: BertConfig = serde_json::from_str(&raw_config)?;
        let labels = LabelMap::from_config_json(&raw_config);

        let device = device_from_str(device)?;
        let weights_file = repo.get(weights_filename)?;
        let vb = if weights_filename.ends_with(".safetensors") {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], DType::F32, &device)? }
        } else {
            VarBuilder::from_pth(&weights_file, DType::F32, &device)?
        };

        let backbone = BertModel::load(vb.pp("bert"), &bert_config)?;
        let pooler = candle_nn::linear(
            bert_config.hidden_size,
            bert_config.hidden_size,
            vb.pp("bert.pooler.dense"),
        )?;
        let classifier = candle_nn::linear(
            bert_config.hidden_size,
            labels.num_labels(),
            vb.pp("classifier"),
        )?;
        let tokenizer = load_tokenizer(repo)?;

        Ok(SequenceClassifierPipeline {
            backbone,
            pooler,
            classifier,
            tokenizer,
            device,
            labels,
            max_length,
        })
    }

    #[tracing::instrument(level = "info", skip(self, sentence))]
    pub fn classify(&self, sentence: &str) -> Result<(String, f32)> {
        let sentence = sentence.to_string();
        let mut results = self.classify_batch(std::slice::from_ref(&sentence))?;
        results
            .pop()
            .ok_or_else(|| anyhow!("Classification produced no result"))
    }

    /// Classifies each sentence, preserving input order. All sentences run
    /// through a single padded forward pass.
    #[tracing::instrument(level = "info", skip(self, sentences))]
    pub fn classify_batch(&self, sentences: &[String]) -> Result<Vec<(String, f32)>> {
        let mut encodings = self
            .tokenizer
            .encode_batch(sentences.to_vec(), true)
            .map_err(|e| anyhow!(e))?;
        for encoding in &mut encodings {
            encoding.truncate(self.max_length, 0, TruncationDirection::Right);
        }

        let longest = encodings.iter().map(|e| e.len()).max().unwrap_or(0);
        if longest == 0 {
            bail!("Tokenizer produced no tokens");
        }

        // Pad to the longest member so a single forward pass covers the whole
        // batch; the attention mask keeps padding out of the logits.
        let mut input_ids = Vec::with_capacity(encodings.len() * longest);
        let mut token_type_ids = Vec::with_capacity(encodings.len() * longest);
        let mut attention_mask = Vec::with_capacity(encodings.len() * longest);
        for encoding in &encodings {
            let ids = encoding.get_ids();
            let padding = longest - ids.len();
            input_ids.extend_from_slice(ids);
            input_ids.extend(std::iter::repeat(0u32).take(padding));
            token_type_ids.extend_from_slice(encoding.get_type_ids());
            token_type_ids.extend(std::iter::repeat(0u32).take(padding));
            attention_mask.extend(std::iter::repeat(1u32).take(ids.len()));
            attention_mask.extend(std::iter::repeat(0u32).take(padding));
        }

        let shape = (encodings.len(), longest);
        let input_ids = Tensor::from_vec(input_ids, shape, &self.device)?;
        let token_type_ids = Tensor::from_vec(token_type_ids, shape, &self.device)?;
        let attention_mask = Tensor::from_vec(attention_mask, shape, &self.device)?;

        let hidden_states =
            self.backbone
                .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // BertForSequenceClassification: tanh pooler over the [CLS] hidden
        // state, then the linear classification head.
        let cls_states = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&cls_states)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        let probabilities = softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

        Ok(probabilities
            .iter()
            .map(|row| {
                let (class_idx, score) = argmax(row);
                (self.labels.resolve(class_idx), score)
            })
            .collect())
    }
}

pub(crate) fn device_from_str(device: &str) -> Result<Device> {
    match device.to_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        _ => bail!("Unknown device {device}"),
    }
}

fn argmax(probabilities: &[f32]) -> (usize, f32) {
    probabilities
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(class_idx, probability)| (class_idx, *probability))
        .unwrap_or((0, 0.0))
}

fn load_tokenizer(repo: &ApiRepo) -> Result<Tokenizer> {
    if let Ok(tokenizer_file) = repo.get("tokenizer.json") {
        return Tokenizer::from_file(tokenizer_file).map_err(|e| anyhow!(e));
    }

    // Older BERT repositories ship only a vocab.txt, build the WordPiece
    // tokenizer by hand in that case.
    let vocab_file = repo.get("vocab.txt")?;
    let wordpiece = WordPiece::from_file(vocab_file.to_string_lossy().as_ref())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| anyhow!(e))?;

    let mut tokenizer = Tokenizer::new(wordpiece);
    tokenizer.with_normalizer(Some(BertNormalizer::default()));
    tokenizer.with_pre_tokenizer(Some(BertPreTokenizer));

    let sep = ("[SEP]".to_string(), 102);
    let cls = ("[CLS]".to_string(), 101);
    tokenizer.with_post_processor(Some(BertProcessing::new(sep, cls)));

    Ok(tokenizer)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::{argmax, device_from_str};

    #[test]
    fn argmax_picks_the_highest_probability() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), (1, 0.7));
        assert_eq!(argmax(&[0.9, 0.05, 0.05]), (0, 0.9));
    }

    #[test]
    fn argmax_on_empty_input_defaults_to_zero() {
        assert_eq!(argmax(&[]), (0, 0.0));
    }

    #[test]
    fn cpu_device_is_always_available() {
        assert!(matches!(device_from_str("cpu").unwrap(), Device::Cpu));
        assert!(matches!(device_from_str("CPU").unwrap(), Device::Cpu));
    }

    #[test]
    fn unknown_device_is_rejected() {
        assert!(device_from_str("tpu").is_err());
    }
}
