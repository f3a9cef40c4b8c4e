use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatorConfig {
    pub beam_width: usize,
    pub n_best: usize,
    pub max_length: usize,
    pub min_length: usize,
    pub pad_token_id: u32,
    pub unk_token_id: u32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    /// Length-normalisation exponent for the GNMT scorer.
    pub alpha: f32,
    /// Coverage-penalty weight for the GNMT scorer.
    pub beta: f32,
    pub stepwise_penalty: bool,
    pub copy_attn: bool,
    pub beam_trace: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            beam_width: 5,
            n_best: 1,
            max_length: 100,
            min_length: 0,
            pad_token_id: 0,
            unk_token_id: 1,
            bos_token_id: 2,
            eos_token_id: 3,
            alpha: 0.0,
            beta: 0.0,
            stepwise_penalty: false,
            copy_attn: false,
            beam_trace: false,
        }
    }
}

impl TranslatorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides("NMT_");
        config
    }

    pub fn apply_env_overrides(&mut self, prefix: &str) {
        let parse_env = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();
        let apply_usize = |suffix: &str, target: &mut usize| {
            if let Some(v) = parse_env(suffix).and_then(|s| s.parse().ok()) {
                *target = v;
            }
        };
        let apply_f32 = |suffix: &str, target: &mut f32| {
            if let Some(v) = parse_env(suffix).and_then(|s| s.parse().ok()) {
                *target = v;
            }
        };
        let apply_bool = |suffix: &str, target: &mut bool| {
            if let Some(v) = parse_env(suffix) {
                *target = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            }
        };

        apply_usize("BEAM_WIDTH", &mut self.beam_width);
        apply_usize("N_BEST", &mut self.n_best);
        apply_usize("MAX_LENGTH", &mut self.max_length);
        apply_usize("MIN_LENGTH", &mut self.min_length);
        apply_f32("ALPHA", &mut self.alpha);
        apply_f32("BETA", &mut self.beta);
        apply_bool("STEPWISE_PENALTY", &mut self.stepwise_penalty);
        apply_bool("COPY_ATTN", &mut self.copy_attn);
        apply_bool("BEAM_TRACE", &mut self.beam_trace);
    }

    /// `true` when the GNMT scorer would change any score.
    pub fn wants_global_scorer(&self) -> bool {
        self.alpha != 0.0 || self.beta != 0.0
    }

    pub fn validate(&self) -> Result<(), TranslateError> {
        if self.beam_width < 1 {
            return Err(TranslateError::Config("beam_width must be at least 1".into()));
        }
        if self.n_best < 1 || self.n_best > self.beam_width {
            return Err(TranslateError::Config(format!(
                "n_best must be between 1 and beam_width ({}), got {}",
                self.beam_width, self.n_best
            )));
        }
        if self.max_length == 0 {
            return Err(TranslateError::Config("max_length must be positive".into()));
        }
        if self.min_length >= self.max_length {
            return Err(TranslateError::Config(format!(
                "min_length ({}) must be below max_length ({})",
                self.min_length, self.max_length
            )));
        }
        if self.bos_token_id == self.eos_token_id {
            return Err(TranslateError::Config(
                "bos and eos must be distinct tokens".into(),
            ));
        }
        if !self.alpha.is_finite() || !self.beta.is_finite() || self.alpha < 0.0 || self.beta < 0.0 {
            return Err(TranslateError::Config(
                "alpha and beta must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}
