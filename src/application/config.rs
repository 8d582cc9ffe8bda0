// ============================================================
// Layer 2 — Run Configuration
// ============================================================
// Two sources are merged into one immutable RunConfig:
//
//   YAML file → ClassificationConfig (hyperparameters; every key
//               it does not name is kept for the dataset)
//   CLI flags → experiment name, start mode, seed, workers,
//               accelerator options
//
// Directory layout derived from `output_root` and `exp_name`:
//   {output_root}/pretrain_{exp_name}/pytorch_model.bin
//   {output_root}/classification_{exp_name}/   ← logs + checkpoints

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::run_state::StartMode;
use crate::error::TrainError;
use crate::infra::checkpoint::MODEL_FILE;
use crate::infra::distributed::AcceleratorOptions;

fn default_k_test() -> usize {
    128
}

fn default_valid_every() -> usize {
    1
}

fn default_num_experts() -> usize {
    8
}

fn default_expert_dim() -> usize {
    16
}

// ─── Classification Config (YAML) ────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub batch_size_train: usize,
    pub batch_size_test:  usize,
    pub init_lr:          f64,
    pub min_lr:           f64,
    pub weight_decay:     f64,
    pub max_epoch:        usize,
    #[serde(default)]
    pub prefix:           String,
    #[serde(default = "default_k_test")]
    pub k_test:           usize,
    #[serde(default = "default_valid_every")]
    pub valid_every:      usize,
    #[serde(default = "default_num_experts")]
    pub num_experts:      usize,
    #[serde(default = "default_expert_dim")]
    pub expert_dim:       usize,

    /// Keys not named above; passed to the dataset constructor.
    #[serde(flatten)]
    pub dataset: BTreeMap<String, serde_yaml::Value>,
}

impl ClassificationConfig {
    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, TrainError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file '{}'", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn validate(&self) -> std::result::Result<(), TrainError> {
        let fail = |msg: String| Err(TrainError::Config(msg));
        if self.batch_size_train == 0 || self.batch_size_test == 0 {
            return fail("batch sizes must be positive".into());
        }
        if self.max_epoch == 0 {
            return fail("max_epoch must be positive".into());
        }
        if !(self.min_lr >= 0.0 && self.min_lr <= self.init_lr) {
            return fail(format!(
                "learning rates must satisfy 0 <= min_lr ({}) <= init_lr ({})",
                self.min_lr, self.init_lr
            ));
        }
        if self.weight_decay < 0.0 {
            return fail(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if self.k_test == 0 {
            return fail("k_test must be at least 1".into());
        }
        if self.valid_every == 0 {
            return fail("valid_every must be at least 1".into());
        }
        if self.num_experts == 0 || self.expert_dim == 0 {
            return fail("num_experts and expert_dim must be positive".into());
        }
        Ok(())
    }
}

// ─── Run Config (YAML + CLI) ─────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub classification:  ClassificationConfig,
    pub exp_name:        String,
    pub output_root:     PathBuf,
    pub from_checkpoint: bool,
    pub evaluate:        bool,
    pub seed:            u64,
    pub world_size:      usize,
    pub accelerator:     AcceleratorOptions,
    /// Launcher mode; accepted for compatibility, not used.
    pub mode:            String,
    /// Launcher port; accepted for compatibility, not used.
    pub port:            String,
}

impl RunConfig {
    /// Logs and checkpoints of this classification run.
    pub fn run_dir(&self) -> PathBuf {
        self.output_root.join(format!("classification_{}", self.exp_name))
    }

    /// Weights produced by the matching pretraining run.
    pub fn pretrain_checkpoint(&self) -> PathBuf {
        self.output_root
            .join(format!("pretrain_{}", self.exp_name))
            .join(MODEL_FILE)
    }

    pub fn start_mode(&self) -> StartMode {
        if self.from_checkpoint {
            StartMode::Resume { checkpoint_dir: self.run_dir() }
        } else {
            StartMode::FreshStart { pretrained_checkpoint: self.pretrain_checkpoint() }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), TrainError> {
        if self.world_size == 0 {
            return Err(TrainError::Config("world_size must be at least 1".into()));
        }
        self.classification.validate()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "\
batch_size_train: 8
batch_size_test: 16
init_lr: 0.00005
min_lr: 0
weight_decay: 0.05
max_epoch: 10
prefix: 'answer: '
k_test: 32
train_file: data/train.jsonl
test_file: data/test.jsonl
answer_list: [no, yes]
";

    fn run_config(from_checkpoint: bool) -> RunConfig {
        RunConfig {
            classification: ClassificationConfig::from_yaml_str(YAML).unwrap(),
            exp_name: "demo".into(),
            output_root: PathBuf::from("logging"),
            from_checkpoint,
            evaluate: false,
            seed: 42,
            world_size: 1,
            accelerator: AcceleratorOptions::default(),
            mode: String::new(),
            port: String::new(),
        }
    }

    #[test]
    fn test_parses_known_keys_and_keeps_the_rest() {
        let cfg = ClassificationConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(cfg.batch_size_train, 8);
        assert_eq!(cfg.min_lr, 0.0);
        assert_eq!(cfg.prefix, "answer: ");
        assert_eq!(cfg.valid_every, 1);
        assert_eq!(cfg.num_experts, 8);
        assert_eq!(
            cfg.dataset.keys().collect::<Vec<_>>(),
            vec!["answer_list", "test_file", "train_file"]
        );
    }

    #[test]
    fn test_missing_required_key_is_rejected() {
        let yaml = YAML.replace("max_epoch: 10\n", "");
        assert!(ClassificationConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (from, to) in [
            ("batch_size_train: 8", "batch_size_train: 0"),
            ("min_lr: 0", "min_lr: 1.0"),
            ("k_test: 32", "k_test: 0"),
            ("weight_decay: 0.05", "weight_decay: -1.0"),
        ] {
            let err = ClassificationConfig::from_yaml_str(&YAML.replace(from, to)).unwrap_err();
            assert!(matches!(err, TrainError::Config(_)), "{from} -> {to}");
        }
    }

    #[test]
    fn test_directory_layout() {
        let cfg = run_config(false);
        assert_eq!(cfg.run_dir(), PathBuf::from("logging/classification_demo"));
        assert_eq!(
            cfg.start_mode(),
            StartMode::FreshStart {
                pretrained_checkpoint: PathBuf::from("logging/pretrain_demo/pytorch_model.bin")
            }
        );
        assert_eq!(
            run_config(true).start_mode(),
            StartMode::Resume { checkpoint_dir: PathBuf::from("logging/classification_demo") }
        );
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = ClassificationConfig::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.yaml"));
    }
}
