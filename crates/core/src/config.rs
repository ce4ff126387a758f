use serde::Deserialize;

/// Root engine configuration. Loaded from environment variables with the
/// prefix `POPUP_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    /// ISO country codes whose visitors require opt-in marketing consent.
    #[serde(default = "default_opt_in_countries")]
    pub opt_in_countries: Vec<String>,
    /// Whether an unresolved geography is treated as requiring consent.
    #[serde(default = "default_fail_closed")]
    pub require_consent_when_geo_unknown: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Host-supplied allow-list of campaign ids. Empty means no restriction.
    #[serde(default)]
    pub allowed_campaigns: Vec<String>,
    /// Host-supplied block-list of campaign ids.
    #[serde(default)]
    pub blocked_campaigns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Default exit-intent sensitivity for rules that omit it (0-100).
    #[serde(default = "default_exit_intent_sensitivity")]
    pub exit_intent_sensitivity: u8,
}

// Default functions
fn default_opt_in_countries() -> Vec<String> {
    // EU/EEA + UK, where marketing popups need prior opt-in.
    [
        "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IS",
        "IT", "LI", "LV", "LT", "LU", "MT", "NL", "NO", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
        "GB",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}
fn default_fail_closed() -> bool {
    true
}
fn default_exit_intent_sensitivity() -> u8 {
    20
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            opt_in_countries: default_opt_in_countries(),
            require_consent_when_geo_unknown: default_fail_closed(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            allowed_campaigns: Vec::new(),
            blocked_campaigns: Vec::new(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            exit_intent_sensitivity: default_exit_intent_sensitivity(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consent: ConsentConfig::default(),
            selection: SelectionConfig::default(),
            triggers: TriggerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("POPUP_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
