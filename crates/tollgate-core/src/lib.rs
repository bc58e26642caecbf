//! Tollgate Core - policy and collaborator contracts.
//!
//! This crate holds everything the interception engine decides on but does
//! not own:
//!
//! - [`policy`] - domain sets, [`PolicySnapshot`] and the routing classifier
//! - [`inspection`] - the DLP [`Inspector`] contract and severity scoring
//! - [`telemetry`] - the fixed-schema [`AuditRecord`] and its sinks
//! - [`settings`] - where policy snapshots come from

pub mod inspection;
pub mod policy;
pub mod settings;
pub mod telemetry;

pub use inspection::{
    clamp_risk_score, risk_score_from_reu, HttpInspector, InspectionAction, InspectionContext,
    InspectionError, InspectionResult, Inspector, PassiveInspector, Severity,
};
pub use policy::{
    service_name, DestinationType, DomainPolicy, PolicyError, PolicySnapshot, Route,
};
pub use settings::{HttpSettings, SettingsError, SettingsSource, StaticSettings};
pub use telemetry::{
    AuditRecord, HttpTelemetry, RecordAction, TelemetrySink, TracingTelemetry, DEFAULT_TELEMETRY_QUEUE,
    DEFAULT_TELEMETRY_TIMEOUT,
};
