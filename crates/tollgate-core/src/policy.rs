//! Domain policy classification.
//!
//! Decides, per CONNECT target, whether a connection is tunnelled untouched,
//! terminated and deep-inspected, or only recorded as metadata.
//!
//! Precedence is fixed:
//!
//! ```text
//! passthrough list ──► Passthrough          (infrastructure / auth, never inspected)
//! AI domain        ──► DeepInspect          (default for AI providers)
//!   └─ desktop app + bypass enabled ──► MetadataOnly
//! anything else    ──► Passthrough
//! ```
//!
//! The [`PolicySnapshot`] is always passed in explicitly. Nothing here caches
//! settings between calls.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure and authentication hosts that are never intercepted.
pub const DEFAULT_PASSTHROUGH_DOMAINS: &[&str] = &[
    // OpenAI auth / assets / telemetry
    "auth.openai.com",
    "auth0.openai.com",
    "cdn.oaistatic.com",
    "oaiusercontent.com",
    "ab.chatgpt.com",
    // Anthropic telemetry
    "statsig.anthropic.com",
    // Identity providers
    "accounts.google.com",
    "oauth2.googleapis.com",
    "login.microsoftonline.com",
    "login.live.com",
    "appleid.apple.com",
    // Error reporting
    "sentry.io",
];

/// AI provider hosts whose traffic is deep-inspected by default.
pub const DEFAULT_AI_DOMAINS: &[&str] = &[
    // OpenAI
    "api.openai.com",
    "chat.openai.com",
    "chatgpt.com",
    // Anthropic
    "claude.ai",
    "api.anthropic.com",
    // Google
    "gemini.google.com",
    "generativelanguage.googleapis.com",
    "aistudio.google.com",
    // xAI
    "grok.com",
    "api.x.ai",
    // Perplexity
    "perplexity.ai",
    // Mistral
    "chat.mistral.ai",
    "api.mistral.ai",
    // Cohere
    "api.cohere.ai",
    // Microsoft Copilot
    "copilot.microsoft.com",
    // DeepSeek
    "chat.deepseek.com",
    "api.deepseek.com",
    // Hugging Face
    "huggingface.co",
];

/// AI hosts used by certificate-pinned desktop apps.
///
/// Must be a subset of [`DEFAULT_AI_DOMAINS`].
pub const DEFAULT_DESKTOP_APP_DOMAINS: &[&str] = &["chatgpt.com", "claude.ai", "copilot.microsoft.com"];

/// Errors from loading domain lists.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Failed to read the domains file.
    #[error("failed to read domains file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse the domains file.
    #[error("failed to parse domains file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A desktop app domain is not an AI domain.
    #[error("desktop app domain {0} is not listed as an AI domain")]
    DesktopNotAi(String),
}

/// Immutable view of the operator settings at one decision point.
///
/// The default value is the safe fallback used when settings cannot be
/// fetched: every flag off, which means minimum enforcement and maximum
/// passthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySnapshot {
    /// Metadata-only logging for desktop apps instead of deep inspection.
    pub desktop_bypass_enabled: bool,
    /// Answer `BLOCK` verdicts with 403 instead of forwarding.
    pub block_high_risk_enabled: bool,
    /// Send multipart bodies to the inspector as well.
    pub inspect_attachments_enabled: bool,
    /// Score the inspector should treat as high risk.
    pub risk_threshold: u8,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            desktop_bypass_enabled: false,
            block_high_risk_enabled: false,
            inspect_attachments_enabled: false,
            risk_threshold: 70,
        }
    }
}

/// Routing decision for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Tunnel bytes without decrypting.
    Passthrough,
    /// Terminate TLS and inspect each request.
    DeepInspect,
    /// Record the connection, then tunnel.
    MetadataOnly,
}

impl Route {
    /// Returns the route as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::DeepInspect => "deep_inspect",
            Self::MetadataOnly => "metadata_only",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of destination, reported to the inspector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    /// Programmatic API endpoint.
    Api,
    /// Browser chat application.
    Web,
    /// Desktop application backend.
    Desktop,
}

/// On-disk format for extra domains.
///
/// ```json
/// { "passthrough": ["auth.example.ai"], "aiDomains": ["chat.example.ai"], "desktopAppDomains": [] }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DomainsFile {
    passthrough: Vec<String>,
    ai_domains: Vec<String>,
    desktop_app_domains: Vec<String>,
}

/// The three statically configured domain sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPolicy {
    passthrough: BTreeSet<String>,
    ai_domains: BTreeSet<String>,
    desktop_app_domains: BTreeSet<String>,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DomainPolicy {
    /// Creates a policy with empty domain sets.
    pub fn empty() -> Self {
        Self {
            passthrough: BTreeSet::new(),
            ai_domains: BTreeSet::new(),
            desktop_app_domains: BTreeSet::new(),
        }
    }

    /// Creates a policy with the built-in domain sets.
    pub fn with_defaults() -> Self {
        let mut policy = Self::empty();
        for d in DEFAULT_PASSTHROUGH_DOMAINS {
            policy.add_passthrough(d);
        }
        for d in DEFAULT_AI_DOMAINS {
            policy.add_ai_domain(d);
        }
        for d in DEFAULT_DESKTOP_APP_DOMAINS {
            policy.add_desktop_app_domain(d);
        }
        policy
    }

    /// Extends the built-in sets with the domains listed in a JSON file.
    pub fn with_defaults_and_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let mut policy = Self::with_defaults();
        policy.merge_file(path)?;
        Ok(policy)
    }

    /// Merges the domains listed in a JSON file into this policy.
    pub fn merge_file(&mut self, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let file: DomainsFile = serde_json::from_str(&raw)?;

        for d in &file.passthrough {
            self.add_passthrough(d);
        }
        for d in &file.ai_domains {
            self.add_ai_domain(d);
        }
        for d in &file.desktop_app_domains {
            if !self.ai_domains.contains(&normalize(d)) {
                return Err(PolicyError::DesktopNotAi(d.clone()));
            }
            self.add_desktop_app_domain(d);
        }

        tracing::info!(
            passthrough = self.passthrough.len(),
            ai = self.ai_domains.len(),
            desktop = self.desktop_app_domains.len(),
            "Loaded domain policy from {:?}",
            path.as_ref()
        );
        Ok(())
    }

    /// Adds a passthrough domain.
    pub fn add_passthrough(&mut self, domain: &str) {
        self.passthrough.insert(normalize(domain));
    }

    /// Adds an AI domain.
    pub fn add_ai_domain(&mut self, domain: &str) {
        self.ai_domains.insert(normalize(domain));
    }

    /// Adds a desktop app domain. It is also added to the AI set.
    pub fn add_desktop_app_domain(&mut self, domain: &str) {
        let domain = normalize(domain);
        self.ai_domains.insert(domain.clone());
        self.desktop_app_domains.insert(domain);
    }

    /// Returns the AI domains, sorted.
    pub fn ai_domains(&self) -> impl Iterator<Item = &str> {
        self.ai_domains.iter().map(String::as_str)
    }

    /// Returns the passthrough domains, sorted.
    pub fn passthrough_domains(&self) -> impl Iterator<Item = &str> {
        self.passthrough.iter().map(String::as_str)
    }

    /// Returns the desktop app domains, sorted.
    pub fn desktop_app_domains(&self) -> impl Iterator<Item = &str> {
        self.desktop_app_domains.iter().map(String::as_str)
    }

    /// Checks if the host is on the passthrough list.
    pub fn is_passthrough(&self, host: &str) -> bool {
        matches_any(&self.passthrough, host)
    }

    /// Checks if the host belongs to an AI provider.
    pub fn is_ai_domain(&self, host: &str) -> bool {
        matches_any(&self.ai_domains, host)
    }

    /// Checks if the host serves a desktop AI app.
    pub fn is_desktop_app(&self, host: &str) -> bool {
        matches_any(&self.desktop_app_domains, host)
    }

    /// Whether TLS should be terminated and requests inspected.
    pub fn should_deep_inspect(&self, host: &str, snapshot: &PolicySnapshot) -> bool {
        !self.is_passthrough(host)
            && self.is_ai_domain(host)
            && !(snapshot.desktop_bypass_enabled && self.is_desktop_app(host))
    }

    /// Whether only connection metadata should be recorded.
    pub fn should_log_metadata_only(&self, host: &str, snapshot: &PolicySnapshot) -> bool {
        snapshot.desktop_bypass_enabled && self.is_desktop_app(host)
    }

    /// Combines the predicates into a single routing decision.
    pub fn classify(&self, host: &str, snapshot: &PolicySnapshot) -> Route {
        if self.is_passthrough(host) {
            Route::Passthrough
        } else if self.should_deep_inspect(host, snapshot) {
            Route::DeepInspect
        } else if self.should_log_metadata_only(host, snapshot) {
            Route::MetadataOnly
        } else {
            Route::Passthrough
        }
    }

    /// Returns the destination type for inspection context.
    pub fn destination_type(&self, host: &str) -> DestinationType {
        let host = strip_port(host);
        if self.is_desktop_app(&host) {
            DestinationType::Desktop
        } else if host.starts_with("api.") || host.contains("googleapis.com") {
            DestinationType::Api
        } else {
            DestinationType::Web
        }
    }
}

/// Returns a human-friendly name for the AI service behind a host.
pub fn service_name(host: &str) -> &'static str {
    let host = strip_port(host);
    let matches = |d: &str| host == d || host.ends_with(&format!(".{}", d));

    if matches("openai.com") || matches("chatgpt.com") {
        "ChatGPT"
    } else if matches("anthropic.com") || matches("claude.ai") {
        "Claude"
    } else if matches("gemini.google.com")
        || matches("generativelanguage.googleapis.com")
        || matches("aistudio.google.com")
    {
        "Gemini"
    } else if matches("x.ai") || matches("grok.com") {
        "Grok"
    } else if matches("perplexity.ai") {
        "Perplexity"
    } else if matches("mistral.ai") {
        "Mistral"
    } else if matches("cohere.ai") || matches("cohere.com") {
        "Cohere"
    } else if matches("copilot.microsoft.com") {
        "Copilot"
    } else if matches("deepseek.com") {
        "DeepSeek"
    } else if matches("huggingface.co") {
        "Hugging Face"
    } else {
        "Unknown"
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn strip_port(host: &str) -> String {
    let host = if host.starts_with('[') {
        host
    } else {
        host.rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(h, _)| h)
            .unwrap_or(host)
    };
    normalize(host)
}

fn matches_any(set: &BTreeSet<String>, host: &str) -> bool {
    let host = strip_port(host);
    if set.contains(&host) {
        return true;
    }
    // Walk parent domains on label boundaries.
    let mut rest = host.as_str();
    while let Some((_, parent)) = rest.split_once('.') {
        if set.contains(parent) {
            return true;
        }
        rest = parent;
    }
    false
}
