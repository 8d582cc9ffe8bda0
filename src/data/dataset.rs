use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::domain::batch::ExpertBundle;
use crate::error::{Result, TrainError};

/// Indexed access to examples, as the batch loader sees a dataset.
pub trait Dataset {
    fn get(&self, index: usize) -> Option<&Example>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One JSON line of a dataset file:
/// `{"experts": [[0.1, 0.2], [0.3, 0.4]], "answer": "yes"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub experts: ExpertBundle,
    pub answer:  String,
}

// ─── Dataset Configuration ───────────────────────────────────────────────────

fn default_answer_list() -> Vec<String> {
    vec!["no".to_string(), "yes".to_string()]
}

fn default_positive_answer() -> String {
    "yes".to_string()
}

/// Dataset keys carried in the extra section of the run config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatasetConfig {
    pub train_file: PathBuf,
    pub test_file:  PathBuf,
    #[serde(default = "default_answer_list")]
    pub answer_list: Vec<String>,
    #[serde(default = "default_positive_answer")]
    pub positive_answer: String,
}

impl DatasetConfig {
    /// Parse the keys the YAML config did not claim for itself.
    pub fn from_extra(extra: &BTreeMap<String, serde_yaml::Value>) -> Result<Self> {
        let mapping: serde_yaml::Mapping = extra
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
            .collect();
        let config: Self = serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .map_err(|e| TrainError::Config(format!("dataset section: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.answer_list.is_empty() {
            return Err(TrainError::Config("answer_list must not be empty".into()));
        }
        if !self.answer_list.contains(&self.positive_answer) {
            return Err(TrainError::Config(format!(
                "positive_answer '{}' is not in answer_list {:?}",
                self.positive_answer, self.answer_list
            )));
        }
        Ok(())
    }
}

// ─── JSONL Dataset ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct JsonlDataset {
    examples: Vec<Example>,
}

impl JsonlDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            TrainError::Dataset(format!("cannot read '{}': {e}", path.display()))
        })?;
        let mut examples = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(line).map_err(|e| {
                TrainError::Dataset(format!("{}:{}: {e}", path.display(), n + 1))
            })?;
            examples.push(example);
        }
        tracing::info!(path = %path.display(), examples = examples.len(), "loaded dataset");
        Ok(Self { examples })
    }
}

impl Dataset for JsonlDataset {
    fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

/// Train and test datasets named by the config.
pub fn create_dataset(config: &DatasetConfig) -> Result<(JsonlDataset, JsonlDataset)> {
    let train = JsonlDataset::from_file(&config.train_file)?;
    let test = JsonlDataset::from_file(&config.test_file)?;
    Ok((train, test))
}
