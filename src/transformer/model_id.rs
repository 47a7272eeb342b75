//! Model id normalization and provider family dispatch.
//!
//! Clients may send `anthropic.claude-3-haiku-20240307-v1:0`,
//! `bedrock/converse/anthropic.claude-3-haiku-20240307-v1:0` or a cross-region
//! profile such as `us.anthropic.claude-3-5-sonnet-20240620-v1:0`. All of these
//! resolve to exactly one backend model id.

use crate::core::error::Result;
use crate::core::AppError;

/// Generic routing prefix accepted in addition to the configured one.
pub const ROUTING_PREFIX: &str = "bedrock/";

/// Default namespace prefix for the Converse route.
pub const DEFAULT_MODEL_PREFIX: &str = "bedrock/converse/";

/// Cross-region inference profile prefixes.
const REGION_PREFIXES: &[&str] = &["us.", "eu.", "apac.", "us-gov.", "global."];

/// Prepend `prefix` unless the id already carries it (or the generic routing prefix).
///
/// Idempotent: `normalize_model_id(normalize_model_id(m, p), p) == normalize_model_id(m, p)`.
pub fn normalize_model_id(requested: &str, prefix: &str) -> String {
    let requested = requested.trim();
    if requested.starts_with(prefix) || requested.starts_with(ROUTING_PREFIX) {
        requested.to_string()
    } else {
        format!("{}{}", prefix, requested)
    }
}

/// Strip the routing prefix from a normalized id, yielding the backend model id.
pub fn backend_model_id<'a>(normalized: &'a str, prefix: &str) -> &'a str {
    normalized
        .strip_prefix(prefix)
        .or_else(|| normalized.strip_prefix(DEFAULT_MODEL_PREFIX))
        .or_else(|| normalized.strip_prefix(ROUTING_PREFIX))
        .unwrap_or(normalized)
}

/// Provider namespace of a backend model id, e.g. `anthropic` for
/// `us.anthropic.claude-3-haiku-20240307-v1:0`. ARNs resolve through their
/// resource name.
pub fn provider_namespace(model_id: &str) -> &str {
    let resource = if model_id.starts_with("arn:") {
        model_id.rsplit('/').next().unwrap_or(model_id)
    } else {
        model_id
    };
    let unprefixed = REGION_PREFIXES
        .iter()
        .find_map(|p| resource.strip_prefix(p))
        .unwrap_or(resource);
    unprefixed.split('.').next().unwrap_or(unprefixed)
}

/// A model id that resolved to exactly one backend model.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    /// The id with the routing prefix applied
    pub routed: String,
    /// The id sent to the backend
    pub backend_id: String,
    pub family: ModelFamily,
}

/// Normalize and resolve a requested model id.
pub fn resolve_model(requested: &str, prefix: &str) -> Result<ResolvedModel> {
    let routed = normalize_model_id(requested, prefix);
    let backend_id = backend_model_id(&routed, prefix).to_string();

    if backend_id.is_empty() {
        return Err(AppError::ModelNotFound(format!(
            "'{}' does not name a model",
            requested
        )));
    }
    if !backend_id.starts_with("arn:") && !backend_id.contains('.') {
        return Err(AppError::ModelNotFound(format!(
            "'{}' has no provider namespace (expected e.g. anthropic.<model>)",
            requested
        )));
    }

    let family = ModelFamily::from_model_id(&backend_id);
    Ok(ResolvedModel {
        routed,
        backend_id,
        family,
    })
}

/// Provider family, dispatched by model id namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Anthropic,
    Amazon,
    Meta,
    Mistral,
    Cohere,
    Ai21,
    DeepSeek,
    Writer,
    Other,
}

/// What a family accepts on the Converse API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyCapabilities {
    pub system_prompt: bool,
    pub tools: bool,
    pub prompt_caching: bool,
    pub top_k: bool,
}

impl ModelFamily {
    pub fn from_model_id(model_id: &str) -> Self {
        match provider_namespace(model_id) {
            "anthropic" => Self::Anthropic,
            "amazon" => Self::Amazon,
            "meta" => Self::Meta,
            "mistral" => Self::Mistral,
            "cohere" => Self::Cohere,
            "ai21" => Self::Ai21,
            "deepseek" => Self::DeepSeek,
            "writer" => Self::Writer,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Amazon => "amazon",
            Self::Meta => "meta",
            Self::Mistral => "mistral",
            Self::Cohere => "cohere",
            Self::Ai21 => "ai21",
            Self::DeepSeek => "deepseek",
            Self::Writer => "writer",
            Self::Other => "other",
        }
    }

    /// Capabilities for a concrete model of this family.
    pub fn capabilities(self, model_id: &str) -> FamilyCapabilities {
        match self {
            Self::Anthropic => FamilyCapabilities {
                system_prompt: true,
                tools: true,
                prompt_caching: true,
                top_k: true,
            },
            Self::Amazon => {
                let titan = model_id.contains("amazon.titan");
                let nova = model_id.contains("amazon.nova");
                FamilyCapabilities {
                    system_prompt: !titan,
                    tools: nova,
                    prompt_caching: nova,
                    top_k: nova,
                }
            }
            Self::Mistral => FamilyCapabilities {
                system_prompt: true,
                tools: true,
                prompt_caching: false,
                top_k: true,
            },
            Self::Cohere => FamilyCapabilities {
                system_prompt: true,
                tools: true,
                prompt_caching: false,
                top_k: true,
            },
            Self::DeepSeek => FamilyCapabilities {
                system_prompt: true,
                tools: false,
                prompt_caching: false,
                top_k: false,
            },
            Self::Meta | Self::Ai21 | Self::Writer | Self::Other => FamilyCapabilities {
                system_prompt: true,
                tools: true,
                prompt_caching: false,
                top_k: false,
            },
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
