//! Inspection contract consumed by the proxy.
//!
//! The DLP engine itself lives outside this workspace. The proxy only sees
//! the [`Inspector`] trait and the [`InspectionResult`] it produces.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::DestinationType;

/// Inspection errors. All of them are handled by the fail-open policy.
#[derive(Debug, Error)]
pub enum InspectionError {
    /// The inspector could not be reached.
    #[error("inspector unreachable: {0}")]
    Unreachable(String),

    /// The inspector answered with an error status.
    #[error("inspector returned HTTP {0}")]
    Status(u16),

    /// The inspector answered with a body we cannot read.
    #[error("invalid inspector response: {0}")]
    InvalidResponse(String),

    /// The inspector did not answer in time.
    #[error("inspection timed out after {0:?}")]
    Timeout(Duration),
}

/// Verdict of an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InspectionAction {
    /// Nothing sensitive found.
    Allow,
    /// Sensitive content found, forward anyway.
    Warn,
    /// The engine would redact before sending.
    Redact,
    /// The engine asks for the request to be blocked.
    Block,
}

impl InspectionAction {
    /// Returns the action as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Redact => "redact",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for InspectionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result produced by the DLP engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionResult {
    /// Verdict.
    pub action: InspectionAction,
    /// Risk score, 0-100.
    pub risk_score: u8,
    /// Labels of what was detected, in detection order.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl InspectionResult {
    /// Creates a result, clamping the score to 100.
    pub fn new(action: InspectionAction, risk_score: u8, flags: Vec<String>) -> Self {
        Self {
            action,
            risk_score: risk_score.min(100),
            flags,
        }
    }

    /// An allow verdict with no findings.
    pub fn allow() -> Self {
        Self::new(InspectionAction::Allow, 0, Vec::new())
    }

    /// Severity derived from the risk score.
    pub fn severity(&self) -> Severity {
        Severity::from_score(self.risk_score)
    }
}

/// Severity label derived from a risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Below 40.
    Low,
    /// 40 to 69.
    Medium,
    /// 70 to 89.
    High,
    /// 90 and above.
    Critical,
}

impl Severity {
    /// Maps a 0-100 risk score to a severity.
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => Self::Critical,
            70..=89 => Self::High,
            40..=69 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Severity of an optional result. A missing result scores 0.
    pub fn of(result: Option<&InspectionResult>) -> Self {
        Self::from_score(result.map(|r| r.risk_score).unwrap_or(0))
    }

    /// Returns the severity label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Clamps a raw score from the wire into 0-100, rounding fractions.
pub fn clamp_risk_score(raw: f64) -> u8 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    raw.round().min(100.0) as u8
}

/// Converts an accumulated risk-exposure value into a 0-100 score.
///
/// 200 units or more saturate at 100.
pub fn risk_score_from_reu(final_reu: f64) -> u8 {
    if !final_reu.is_finite() || final_reu <= 0.0 {
        return 0;
    }
    (final_reu / 200.0 * 100.0).round().min(100.0) as u8
}

/// What the inspector is told about the request besides the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionContext {
    /// Service name, e.g. "ChatGPT".
    pub app_name: String,
    /// Kind of destination.
    pub destination_type: DestinationType,
    /// Risk score the operator treats as high.
    pub risk_threshold: u8,
}

/// The DLP engine.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Inspects a request body.
    async fn inspect(
        &self,
        body: &str,
        context: &InspectionContext,
    ) -> Result<InspectionResult, InspectionError>;
}

/// Inspector that allows everything. Used when no DLP endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveInspector;

#[async_trait]
impl Inspector for PassiveInspector {
    async fn inspect(
        &self,
        _body: &str,
        _context: &InspectionContext,
    ) -> Result<InspectionResult, InspectionError> {
        Ok(InspectionResult::allow())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectRequest<'a> {
    text: &'a str,
    #[serde(flatten)]
    context: &'a InspectionContext,
}

/// Wire format of the DLP endpoint. Either `riskScore` or `finalReu` is set.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectResponse {
    action: InspectionAction,
    risk_score: Option<f64>,
    final_reu: Option<f64>,
    #[serde(default)]
    flags: Vec<String>,
}

impl From<InspectResponse> for InspectionResult {
    fn from(resp: InspectResponse) -> Self {
        let score = resp
            .risk_score
            .map(clamp_risk_score)
            .or_else(|| resp.final_reu.map(risk_score_from_reu))
            .unwrap_or(0);
        InspectionResult::new(resp.action, score, resp.flags)
    }
}

/// Inspector backed by an HTTP DLP endpoint.
#[derive(Debug, Clone)]
pub struct HttpInspector {
    client: reqwest::Client,
    url: String,
}

impl HttpInspector {
    /// Creates an inspector posting to the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Inspector for HttpInspector {
    async fn inspect(
        &self,
        body: &str,
        context: &InspectionContext,
    ) -> Result<InspectionResult, InspectionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&InspectRequest { text: body, context })
            .send()
            .await
            .map_err(|e| InspectionError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InspectionError::Status(response.status().as_u16()));
        }

        let parsed: InspectResponse = response
            .json()
            .await
            .map_err(|e| InspectionError::InvalidResponse(e.to_string()))?;
        Ok(parsed.into())
    }
}
