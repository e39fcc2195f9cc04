use std::collections::HashMap;

use serde::Deserialize;

/// The slice of a Hugging Face model `config.json` that drives label resolution.
#[derive(Deserialize, Debug, Default)]
struct HubLabelConfig {
    #[serde(default)]
    id2label: HashMap<String, String>,
}

/// Maps model output class indices to assertion labels.
///
/// The mapping is read from the model config when it carries one, so a
/// fine-tuned checkpoint with its own label names keeps working. Class
/// indices without an entry resolve to `UNKNOWN_<idx>`.
#[derive(Debug, Clone)]
pub struct LabelMap {
    labels: HashMap<usize, String>,
}

impl Default for LabelMap {
    fn default() -> Self {
        let labels = HashMap::from([
            (0, "PRESENT".to_string()),
            (1, "ABSENT".to_string()),
            (2, "CONDITIONAL".to_string()),
        ]);
        Self { labels }
    }
}

impl LabelMap {
    /// Builds the label map from a raw model `config.json`, falling back to
    /// the default assertion mapping when no usable `id2label` table exists.
    pub fn from_config_json(raw: &str) -> Self {
        let parsed: HubLabelConfig = serde_json::from_str(raw).unwrap_or_default();
        let labels: HashMap<usize, String> = parsed
            .id2label
            .into_iter()
            .filter_map(|(id, label)| id.parse::<usize>().ok().map(|id| (id, label)))
            .collect();

        if labels.is_empty() {
            return Self::default();
        }
        Self { labels }
    }

    pub fn resolve(&self, class_idx: usize) -> String {
        self.labels
            .get(&class_idx)
            .cloned()
            .unwrap_or_else(|| format!("UNKNOWN_{class_idx}"))
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::LabelMap;

    #[test]
    fn default_mapping_covers_assertion_labels() {
        let labels = LabelMap::default();
        assert_eq!(labels.num_labels(), 3);
        assert_eq!(labels.resolve(0), "PRESENT");
        assert_eq!(labels.resolve(1), "ABSENT");
        assert_eq!(labels.resolve(2), "CONDITIONAL");
    }

    #[test]
    fn unmapped_class_resolves_to_unknown() {
        let labels = LabelMap::default();
        assert_eq!(labels.resolve(5), "UNKNOWN_5");
    }

    #[test]
    fn config_mapping_takes_precedence() {
        let raw = r#"{
            "hidden_size": 768,
            "id2label": { "0": "PRESENT", "1": "ABSENT", "2": "POSSIBLE" }
        }"#;

        let labels = LabelMap::from_config_json(raw);
        assert_eq!(labels.num_labels(), 3);
        assert_eq!(labels.resolve(2), "POSSIBLE");
    }

    #[test]
    fn config_without_labels_falls_back() {
        let labels = LabelMap::from_config_json(r#"{ "hidden_size": 768 }"#);
        assert_eq!(labels.resolve(0), "PRESENT");

        let labels = LabelMap::from_config_json("not json");
        assert_eq!(labels.resolve(1), "ABSENT");
    }

    #[test]
    fn non_numeric_label_ids_are_skipped() {
        let raw = r#"{ "id2label": { "0": "PRESENT", "first": "ABSENT" } }"#;
        let labels = LabelMap::from_config_json(raw);
        assert_eq!(labels.num_labels(), 1);
        assert_eq!(labels.resolve(0), "PRESENT");
    }
}
