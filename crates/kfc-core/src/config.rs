use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (kfc.toml + KFC_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KfcConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub continuous_thinking: ContinuousThinkingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_model_task")]
    pub model_task: String,
    #[serde(default)]
    pub native_multimodal: bool,
    #[serde(default = "default_max_images_per_payload")]
    pub max_images_per_payload: usize,
    #[serde(default = "default_max_compat_retries")]
    pub max_compat_retries: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_task: default_model_task(),
            native_multimodal: false,
            max_images_per_payload: default_max_images_per_payload(),
            max_compat_retries: default_max_compat_retries(),
        }
    }
}

/// Wait-policy clamping rules. `apply` mirrors the behavior mandated by the
/// dialogue loop's wait-seconds computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_min_seconds")]
    pub min_seconds: f64,
    #[serde(default = "default_max_seconds")]
    pub max_seconds: f64,
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_min_seconds(),
            max_seconds: default_max_seconds(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
        }
    }
}

impl WaitConfig {
    /// Clamp a model-requested wait duration against the configured policy.
    /// `raw_seconds <= 0` means "do not wait" and always yields 0.
    pub fn apply(&self, raw_seconds: f64, consecutive_timeout_count: u32) -> f64 {
        if raw_seconds <= 0.0 {
            return 0.0;
        }
        if consecutive_timeout_count >= self.max_consecutive_timeouts {
            return 0.0;
        }
        raw_seconds.max(self.min_seconds).min(self.max_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: u64,
    #[serde(default = "default_trigger_probability")]
    pub trigger_probability: f64,
    #[serde(default = "default_proactive_min_interval")]
    pub min_interval: u64,
    #[serde(default = "default_quiet_hours_start")]
    pub quiet_hours_start: String,
    #[serde(default = "default_quiet_hours_end")]
    pub quiet_hours_end: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold: default_silence_threshold(),
            trigger_probability: default_trigger_probability(),
            min_interval: default_proactive_min_interval(),
            quiet_hours_start: default_quiet_hours_start(),
            quiet_hours_end: default_quiet_hours_end(),
            check_interval: default_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_typing_chars_per_sec")]
    pub typing_chars_per_sec: f64,
    #[serde(default = "default_typing_delay_min")]
    pub typing_delay_min: f64,
    #[serde(default = "default_typing_delay_max")]
    pub typing_delay_max: f64,
    #[serde(default = "default_max_segment_length")]
    pub max_segment_length: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            typing_chars_per_sec: default_typing_chars_per_sec(),
            typing_delay_min: default_typing_delay_min(),
            typing_delay_max: default_typing_delay_max(),
            max_segment_length: default_max_segment_length(),
        }
    }
}

impl ReplyConfig {
    /// Simulated typing delay for a segment of the given length, seconds.
    pub fn typing_delay_for(&self, char_count: usize) -> f64 {
        if self.typing_chars_per_sec <= 0.0 {
            return 0.0;
        }
        let base = char_count as f64 / self.typing_chars_per_sec;
        base.max(self.typing_delay_min).min(self.typing_delay_max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    #[serde(default = "default_max_context_payloads")]
    pub max_context_payloads: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_log_entries: default_max_log_entries(),
            max_context_payloads: default_max_context_payloads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousThinkingConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_progress_thresholds")]
    pub progress_thresholds: Vec<f64>,
    #[serde(default = "default_continuous_thinking_min_interval")]
    pub min_interval: f64,
}

impl Default for ContinuousThinkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            progress_thresholds: default_progress_thresholds(),
            min_interval: default_continuous_thinking_min_interval(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_model_task() -> String {
    "actor".to_string()
}
fn default_max_images_per_payload() -> usize {
    4
}
fn default_max_compat_retries() -> u32 {
    1
}
fn default_min_seconds() -> f64 {
    10.0
}
fn default_max_seconds() -> f64 {
    600.0
}
fn default_max_consecutive_timeouts() -> u32 {
    3
}
fn default_silence_threshold() -> u64 {
    7200
}
fn default_trigger_probability() -> f64 {
    0.3
}
fn default_proactive_min_interval() -> u64 {
    1800
}
fn default_quiet_hours_start() -> String {
    "23:00".to_string()
}
fn default_quiet_hours_end() -> String {
    "07:00".to_string()
}
fn default_check_interval() -> u64 {
    60
}
fn default_typing_chars_per_sec() -> f64 {
    15.0
}
fn default_typing_delay_min() -> f64 {
    0.8
}
fn default_typing_delay_max() -> f64 {
    4.0
}
fn default_max_segment_length() -> usize {
    200
}
fn default_max_log_entries() -> usize {
    50
}
fn default_max_context_payloads() -> usize {
    20
}
fn default_progress_thresholds() -> Vec<f64> {
    vec![0.3, 0.6, 0.85]
}
fn default_continuous_thinking_min_interval() -> f64 {
    30.0
}

impl KfcConfig {
    /// Load config from a TOML file with `KFC_*` env var overrides
    /// (e.g. `KFC_WAIT_MIN_SECONDS=5`).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("KFC_").split("_"))
            .extract()
            .map_err(|e| crate::error::KfcError::Config(e.to_string()))
    }

    /// Load straight from a TOML string — used by hosts that keep config
    /// embedded rather than on disk, and by tests.
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::KfcError::Config(e.to_string()))
    }
}
