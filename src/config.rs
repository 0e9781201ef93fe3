//! Client configuration: a TOML file, environment overrides and built-in personas.
//!
//! Resolution order, lowest to highest: defaults, TOML file (`--config` or
//! `STUDIO_CONFIG`), `STUDIO_BASE_URL`, then whatever the CLI applies on top.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StudioError};
use crate::session::{
    ChatOptions, SessionConfig, DEFAULT_BASE_URL, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};

pub const CONFIG_ENV: &str = "STUDIO_CONFIG";
pub const BASE_URL_ENV: &str = "STUDIO_BASE_URL";

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

/// Canned system prompts selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Default,
    Coder,
    Creative,
    English,
}

impl Persona {
    pub const ALL: [Persona; 4] = [Persona::Default, Persona::Coder, Persona::Creative, Persona::English];

    pub fn system_prompt(self) -> &'static str {
        match self {
            Persona::Default => "You are a helpful assistant. Give short, clear answers in Turkish.",
            Persona::Coder => {
                "You are an expert software engineer. Provide clean, efficient, well-documented code."
            }
            Persona::Creative => "You are a creative writer. You can write stories, poems and scripts.",
            Persona::English => "You are a helpful assistant. Respond in English.",
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::Default => write!(f, "default"),
            Persona::Coder => write!(f, "coder"),
            Persona::Creative => write!(f, "creative"),
            Persona::English => write!(f, "english"),
        }
    }
}

impl FromStr for Persona {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Persona::Default),
            "coder" => Ok(Persona::Coder),
            "creative" => Ok(Persona::Creative),
            "english" => Ok(Persona::English),
            _ => Err(StudioError::UnknownPersona(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StudioConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudioConfig {
    pub base_url: String,
    pub history_limit: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub persona: String,
    /// Overrides the persona prompt when set.
    pub system_prompt: Option<String>,
    /// Plain-text file whose contents are sent as retrieved context.
    pub context_file: Option<PathBuf>,
    /// Forwarded verbatim as extra request fields.
    pub extra: Map<String, Value>,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            persona: Persona::Default.to_string(),
            system_prompt: None,
            context_file: None,
            extra: Map::new(),
        }
    }
}

impl StudioConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StudioConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| StudioError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Load using the process environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_with(explicit, |key| std::env::var(key).ok())
    }

    /// Load with an injectable environment lookup.
    pub fn resolve_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = explicit.map(Path::to_path_buf).or_else(|| env(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(p) => {
                tracing::debug!(path = %p.display(), "loading config");
                Self::load(&p)?
            }
            None => Self::default(),
        };
        if let Some(url) = env(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            config.base_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(StudioError::Config(format!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(StudioError::Config(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(StudioError::Config("max_tokens must be positive".into()));
        }
        self.persona()?;
        Ok(())
    }

    pub fn persona(&self) -> Result<Persona> {
        self.persona.parse()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig { base_url: self.base_url.clone(), history_limit: self.history_limit }
    }

    /// Request options, reading `context_file` if configured.
    pub fn chat_options(&self) -> Result<ChatOptions> {
        let system_prompt = match &self.system_prompt {
            Some(p) => p.clone(),
            None => self.persona()?.system_prompt().to_string(),
        };
        let context = match &self.context_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|source| StudioError::Io { path: path.clone(), source })?,
            ),
            None => None,
        };
        Ok(ChatOptions {
            system_prompt: Some(system_prompt),
            context,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            extra: self.extra.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_are_valid() {
        let c = StudioConfig::default();
        c.validate().expect("valid");
        assert_eq!(c.base_url, "http://localhost:16070");
        assert_eq!(c.history_limit, 10);
        assert_eq!(c.max_tokens, 1024);
    }

    #[test]
    fn test_persona_parse() {
        assert_eq!("Coder".parse::<Persona>().expect("coder"), Persona::Coder);
        assert_eq!(" english ".parse::<Persona>().expect("english"), Persona::English);
        assert!(matches!("pirate".parse::<Persona>(), Err(StudioError::UnknownPersona(_))));
    }

    #[test]
    fn test_persona_display_roundtrips() {
        for p in Persona::ALL {
            assert_eq!(p.to_string().parse::<Persona>().expect("parse"), p);
            assert!(!p.system_prompt().is_empty());
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let c = StudioConfig::from_toml_str(
            r#"
            base_url = "http://10.0.0.5:16070"
            history_limit = 4
            persona = "coder"

            [extra]
            top_p = 0.9
            reasoning_effort = "low"
            "#,
        )
        .expect("parse");
        assert_eq!(c.history_limit, 4);
        assert_eq!(c.temperature, 0.7);
        assert_eq!(c.persona().expect("persona"), Persona::Coder);
        assert_eq!(c.extra["top_p"], 0.9);
        assert_eq!(c.extra["reasoning_effort"], "low");
    }

    #[test]
    fn test_from_toml_rejects_unknown_key() {
        assert!(matches!(
            StudioConfig::from_toml_str("histroy_limit = 3"),
            Err(StudioError::Toml(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_temp = StudioConfig { temperature: 3.5, ..Default::default() };
        assert!(matches!(bad_temp.validate(), Err(StudioError::Config(_))));

        let bad_url = StudioConfig { base_url: "localhost:16070".into(), ..Default::default() };
        assert!(matches!(bad_url.validate(), Err(StudioError::Config(_))));

        let bad_persona = StudioConfig { persona: "pirate".into(), ..Default::default() };
        assert!(matches!(bad_persona.validate(), Err(StudioError::UnknownPersona(_))));

        let zero_tokens = StudioConfig { max_tokens: 0, ..Default::default() };
        assert!(zero_tokens.validate().is_err());
    }

    #[test]
    fn test_resolve_env_base_url_override() {
        let c = StudioConfig::resolve_with(None, |k| {
            (k == BASE_URL_ENV).then(|| "http://gpu-box:8080".to_string())
        })
        .expect("resolve");
        assert_eq!(c.base_url, "http://gpu-box:8080");
    }

    #[test]
    fn test_resolve_without_file_is_default() {
        assert_eq!(StudioConfig::resolve_with(None, no_env).expect("resolve"), StudioConfig::default());
    }

    #[test]
    fn test_resolve_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            StudioConfig::resolve_with(Some(&missing), no_env),
            Err(StudioError::Io { .. })
        ));
    }

    #[test]
    fn test_chat_options_uses_persona_unless_overridden() {
        let c = StudioConfig { persona: "english".into(), ..Default::default() };
        let o = c.chat_options().expect("options");
        assert_eq!(o.system_prompt.as_deref(), Some(Persona::English.system_prompt()));
        assert!(o.context.is_none());

        let c = StudioConfig { system_prompt: Some("Only haiku.".into()), ..Default::default() };
        assert_eq!(c.chat_options().expect("options").system_prompt.as_deref(), Some("Only haiku."));
    }

    #[test]
    fn test_chat_options_reads_context_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("context.txt");
        std::fs::write(&path, "Q3 revenue was 12M.").expect("write");
        let c = StudioConfig { context_file: Some(path), ..Default::default() };
        let o = c.chat_options().expect("options");
        assert_eq!(o.context.as_deref(), Some("Q3 revenue was 12M."));
        assert!(o.system_message().expect("system").starts_with("CONTEXT:\nQ3 revenue"));
    }

    #[test]
    fn test_resolve_reads_file_then_env_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("studio.toml");
        std::fs::write(&path, "base_url = \"http://from-file:1\"\nmax_tokens = 64\n").expect("write");

        let from_env_path = StudioConfig::resolve_with(None, |k| {
            (k == CONFIG_ENV).then(|| path.display().to_string())
        })
        .expect("resolve");
        assert_eq!(from_env_path.base_url, "http://from-file:1");
        assert_eq!(from_env_path.max_tokens, 64);

        let overridden = StudioConfig::resolve_with(Some(&path), |k| {
            (k == BASE_URL_ENV).then(|| "http://from-env:2".to_string())
        })
        .expect("resolve");
        assert_eq!(overridden.base_url, "http://from-env:2");
        assert_eq!(overridden.max_tokens, 64);
    }

    #[test]
    fn test_session_config_mapping() {
        let c = StudioConfig { history_limit: 3, ..Default::default() };
        let s = c.session_config();
        assert_eq!(s.history_limit, 3);
        assert_eq!(s.base_url, c.base_url);
    }
}
