use std::fmt;
use std::str::FromStr;

use remote_swe_common::Error;

/// Prompt sections that may carry a cache marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSection {
    System,
    Message,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoiceKind {
    Any,
    Auto,
    Tool,
}

/// What a model accepts. Requests are shaped against this before sending.
#[derive(Debug, Clone, Copy)]
pub struct ModelCapabilities {
    pub max_output_tokens: u32,
    pub cache_sections: &'static [CacheSection],
    pub reasoning: bool,
    pub tool_choices: &'static [ToolChoiceKind],
}

impl ModelCapabilities {
    pub fn supports_cache(&self, section: CacheSection) -> bool {
        self.cache_sections.contains(&section)
    }

    pub fn supports_tool_choice(&self, kind: ToolChoiceKind) -> bool {
        self.tool_choices.contains(&kind)
    }
}

const ALL_TOOL_CHOICES: &[ToolChoiceKind] =
    &[ToolChoiceKind::Any, ToolChoiceKind::Auto, ToolChoiceKind::Tool];

const SONNET_35_V1: ModelCapabilities = ModelCapabilities {
    max_output_tokens: 4096,
    cache_sections: &[],
    reasoning: false,
    tool_choices: ALL_TOOL_CHOICES,
};

const SONNET_35: ModelCapabilities = ModelCapabilities {
    max_output_tokens: 4096,
    cache_sections: &[],
    reasoning: false,
    tool_choices: ALL_TOOL_CHOICES,
};

const SONNET_37: ModelCapabilities = ModelCapabilities {
    max_output_tokens: 8192,
    cache_sections: &[CacheSection::System, CacheSection::Message, CacheSection::Tool],
    reasoning: true,
    tool_choices: ALL_TOOL_CHOICES,
};

const HAIKU_35: ModelCapabilities = ModelCapabilities {
    max_output_tokens: 4096,
    cache_sections: &[],
    reasoning: false,
    tool_choices: ALL_TOOL_CHOICES,
};

const NOVA_PRO: ModelCapabilities = ModelCapabilities {
    max_output_tokens: 5000,
    cache_sections: &[CacheSection::System],
    reasoning: false,
    tool_choices: &[ToolChoiceKind::Auto],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Sonnet35V1,
    Sonnet35,
    Sonnet37,
    Haiku35,
    NovaPro,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Sonnet35V1,
        ModelKind::Sonnet35,
        ModelKind::Sonnet37,
        ModelKind::Haiku35,
        ModelKind::NovaPro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Sonnet35V1 => "sonnet3.5v1",
            ModelKind::Sonnet35 => "sonnet3.5",
            ModelKind::Sonnet37 => "sonnet3.7",
            ModelKind::Haiku35 => "haiku3.5",
            ModelKind::NovaPro => "nova-pro",
        }
    }

    /// Region-independent model identifier.
    pub fn base_model_id(&self) -> &'static str {
        match self {
            ModelKind::Sonnet35V1 => "anthropic.claude-3-5-sonnet-20240620-v1:0",
            ModelKind::Sonnet35 => "anthropic.claude-3-5-sonnet-20241022-v2:0",
            ModelKind::Sonnet37 => "anthropic.claude-3-7-sonnet-20250219-v1:0",
            ModelKind::Haiku35 => "anthropic.claude-3-5-haiku-20241022-v1:0",
            ModelKind::NovaPro => "amazon.nova-pro-v1:0",
        }
    }

    /// Cross-region inference profile id for `region`, e.g. `us.amazon.nova-pro-v1:0`.
    pub fn model_id_for_region(&self, region: &str) -> String {
        match region_prefix(region) {
            Some(prefix) => format!("{prefix}.{}", self.base_model_id()),
            None => self.base_model_id().to_string(),
        }
    }

    pub fn capabilities(&self) -> &'static ModelCapabilities {
        match self {
            ModelKind::Sonnet35V1 => &SONNET_35_V1,
            ModelKind::Sonnet35 => &SONNET_35,
            ModelKind::Sonnet37 => &SONNET_37,
            ModelKind::Haiku35 => &HAIKU_35,
            ModelKind::NovaPro => &NOVA_PRO,
        }
    }
}

fn region_prefix(region: &str) -> Option<&'static str> {
    if region.starts_with("us-") {
        Some("us")
    } else if region.starts_with("eu-") {
        Some("eu")
    } else if region.starts_with("ap-") {
        Some("apac")
    } else {
        None
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown model '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in ModelKind::ALL {
            assert_eq!(kind.as_str().parse::<ModelKind>().expect("parse"), kind);
        }
        assert!("gpt-4".parse::<ModelKind>().is_err());
    }

    #[test]
    fn region_prefix_follows_geography() {
        assert_eq!(
            ModelKind::Sonnet37.model_id_for_region("us-west-2"),
            "us.anthropic.claude-3-7-sonnet-20250219-v1:0"
        );
        assert_eq!(
            ModelKind::NovaPro.model_id_for_region("eu-central-1"),
            "eu.amazon.nova-pro-v1:0"
        );
        assert_eq!(
            ModelKind::Haiku35.model_id_for_region("ap-northeast-1"),
            "apac.anthropic.claude-3-5-haiku-20241022-v1:0"
        );
    }

    #[test]
    fn only_sonnet_37_reasons_and_caches_messages() {
        for kind in ModelKind::ALL {
            let caps = kind.capabilities();
            assert_eq!(caps.reasoning, kind == ModelKind::Sonnet37);
            assert_eq!(
                caps.supports_cache(CacheSection::Message),
                kind == ModelKind::Sonnet37
            );
        }
        assert!(ModelKind::NovaPro.capabilities().supports_cache(CacheSection::System));
        assert!(!ModelKind::NovaPro.capabilities().supports_tool_choice(ToolChoiceKind::Any));
        assert_eq!(ModelKind::NovaPro.capabilities().max_output_tokens, 5000);
    }
}
