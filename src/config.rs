use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{InsightError, Result};
use crate::heuristics::DEFAULT_MIN_SECTION_CHARS;
use crate::llm::gateway::GenerationParams;
use crate::schema::Language;

/// Tunables for the refinement flow. Timeouts are serialized as whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Fixed session language. When unset, it is detected from the grounding document.
    pub language: Option<Language>,

    #[serde(with = "duration_secs")]
    pub discussion_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub synthesis_timeout: Duration,

    /// The evolution call rewrites a whole report and is by far the slowest.
    #[serde(with = "duration_secs")]
    pub evolution_timeout: Duration,

    pub discussion: GenerationParams,
    pub synthesis: GenerationParams,
    pub evolution: GenerationParams,

    /// Minimum characters a header-delimited section must capture to count as recovered.
    pub min_section_chars: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            language: None,
            discussion_timeout: Duration::from_secs(45),
            synthesis_timeout: Duration::from_secs(120),
            evolution_timeout: Duration::from_secs(600),
            discussion: GenerationParams::new(0.7, 2048),
            synthesis: GenerationParams::new(0.3, 4096),
            evolution: GenerationParams::new(0.4, 8192),
            min_section_chars: DEFAULT_MIN_SECTION_CHARS,
        }
    }
}

impl RefinementConfig {
    /// Defaults overlaid with `INSIGHT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(code) = lookup("INSIGHT_LANGUAGE") {
            let language = Language::parse(&code).ok_or_else(|| {
                InsightError::Config(format!("INSIGHT_LANGUAGE: unsupported language '{}'", code))
            })?;
            config.language = Some(language);
        }
        if let Some(secs) = parse_var(&lookup, "INSIGHT_DISCUSSION_TIMEOUT_SECS")? {
            config.discussion_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "INSIGHT_SYNTHESIS_TIMEOUT_SECS")? {
            config.synthesis_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "INSIGHT_EVOLUTION_TIMEOUT_SECS")? {
            config.evolution_timeout = Duration::from_secs(secs);
        }
        if let Some(chars) = parse_var(&lookup, "INSIGHT_MIN_SECTION_CHARS")? {
            config.min_section_chars = chars as usize;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("discussion_timeout", self.discussion_timeout),
            ("synthesis_timeout", self.synthesis_timeout),
            ("evolution_timeout", self.evolution_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(InsightError::Config(format!("{} must be positive", name)));
            }
        }

        let params = [
            ("discussion", &self.discussion),
            ("synthesis", &self.synthesis),
            ("evolution", &self.evolution),
        ];
        for (name, params) in params {
            if !(0.0..=2.0).contains(&params.temperature) {
                return Err(InsightError::Config(format!(
                    "{} temperature {} must be between 0.0 and 2.0",
                    name, params.temperature
                )));
            }
            if params.max_output_tokens == 0 {
                return Err(InsightError::Config(format!(
                    "{} max_output_tokens must be positive",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| InsightError::Config(format!("{}: '{}' ({})", key, raw, e)))
        })
        .transpose()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
