use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::decision::Verdict;
use crate::error::ErrorKind;

/// One line in the authentication audit trail.
///
/// Holds identifiers, the outcome and the score only; features and pixel
/// data have no place here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub identity: Option<String>,
    pub service: Option<String>,
    pub outcome: &'static str,
    pub kind: Option<ErrorKind>,
    pub score: Option<f64>,
    pub template: Option<String>,
    pub skipped_records: usize,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        identity: Option<String>,
        service: Option<String>,
        verdict: &Verdict,
        skipped_records: usize,
        attempts: u32,
    ) -> Self {
        let template = match verdict {
            Verdict::Accept { template, .. } => Some(template.clone()),
            _ => None,
        };
        Self {
            identity,
            service,
            outcome: verdict.label(),
            kind: verdict.kind(),
            score: verdict.score(),
            template,
            skipped_records,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn is_accept(&self) -> bool {
        self.outcome == "accept"
    }
}

/// A caller-supplied value. Anything besides plain printable ASCII is
/// written quoted and escaped so it stays inside its own field.
struct Field<'a>(Option<&'a str>);

impl fmt::Display for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("?"),
            Some(value)
                if !value.is_empty()
                    && value
                        .chars()
                        .all(|c| c.is_ascii_graphic() && c != '"' && c != '=') =>
            {
                f.write_str(value)
            }
            Some(value) => write!(f, "{value:?}"),
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outcome={} user={} service={}",
            self.outcome,
            Field(self.identity.as_deref()),
            Field(self.service.as_deref()),
        )?;
        if let Some(kind) = self.kind {
            write!(f, " kind={kind}")?;
        }
        if let Some(score) = self.score {
            write!(f, " score={score:.3}")?;
        }
        if let Some(template) = &self.template {
            write!(f, " template={}", Field(Some(template)))?;
        }
        write!(
            f,
            " skipped={} attempts={} at={}",
            self.skipped_records,
            self.attempts,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

pub trait AuditSink {
    fn record(&self, event: &AuditEvent);
}

/// Writes audit events to the `tracing` subscriber, if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        if event.is_accept() {
            info!(target: "audit", "{event}");
        } else {
            warn!(target: "audit", "{event}");
        }
    }
}
