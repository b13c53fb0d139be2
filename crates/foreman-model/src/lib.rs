pub mod adapter;
pub mod driver;
pub mod extract;
pub mod gateway;
pub mod sanitize;
mod anthropic;
mod openai_compat;
mod types;

pub use adapter::{Adapter, ParsedResponse};
pub use anthropic::AnthropicDriver;
pub use driver::{ChatDriver, RawEvent, RawStream, Script, ScriptedDriver, WireRequest};
pub use gateway::{resolve_strategy, ChunkFilter, Gateway, ToolStrategy};
pub use openai_compat::OpenAiCompatDriver;
pub use types::{
    ChatStream, FunctionCall, Message, Role, StreamEvent, ToolCall, ToolSchema, Usage,
};

use std::sync::Arc;

use foreman_config::{ProviderConfig, ProviderFamily};

/// Construct the HTTP driver for a provider configuration.
///
/// Anthropic speaks its own Messages API; every other family is served by the
/// OpenAI-compatible driver with a family-appropriate default base URL.
pub fn driver_from_config(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ChatDriver>> {
    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };
    match cfg.family {
        ProviderFamily::Anthropic => Ok(Arc::new(AnthropicDriver::new(
            cfg.name.clone(),
            cfg.base_url.as_deref(),
            cfg.api_key_env.clone(),
        ))),
        ProviderFamily::Openai => Ok(Arc::new(OpenAiCompatDriver::new(
            cfg.name.clone(),
            &base_url("https://api.openai.com/v1"),
            cfg.api_key_env.clone(),
        ))),
        ProviderFamily::Deepseek => Ok(Arc::new(OpenAiCompatDriver::new(
            cfg.name.clone(),
            &base_url("https://api.deepseek.com/v1"),
            cfg.api_key_env.clone(),
        ))),
        ProviderFamily::Ollama => Ok(Arc::new(OpenAiCompatDriver::new(
            cfg.name.clone(),
            &base_url("http://localhost:11434/v1"),
            cfg.api_key_env.clone(),
        ))),
        ProviderFamily::Other => {
            let base = cfg.base_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "provider {} (family \"other\") requires base_url in config",
                    cfg.name
                )
            })?;
            Ok(Arc::new(OpenAiCompatDriver::new(
                cfg.name.clone(),
                base,
                cfg.api_key_env.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_config::ToolMode;

    fn cfg(family: ProviderFamily, base_url: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            name: "p".into(),
            family,
            base_url: base_url.map(|s| s.into()),
            api_key_env: None,
            tool_mode: ToolMode::Auto,
            default_model: "m".into(),
        }
    }

    #[test]
    fn known_families_construct_drivers() {
        for family in [
            ProviderFamily::Openai,
            ProviderFamily::Anthropic,
            ProviderFamily::Ollama,
            ProviderFamily::Deepseek,
        ] {
            assert!(driver_from_config(&cfg(family, None)).is_ok());
        }
    }

    #[test]
    fn other_family_requires_base_url() {
        assert!(driver_from_config(&cfg(ProviderFamily::Other, None)).is_err());
        assert!(driver_from_config(&cfg(ProviderFamily::Other, Some("http://localhost:8000/v1"))).is_ok());
    }
}
