//! Fingerprint verification core for `pam_fingerprint`.
//!
//! Control flow for one login:
//!
//! ```text
//! adapter ── identity ──> store::load_templates
//!    │
//!    └── capture ──> extract ──> decision (matcher × templates) ──> verdict
//! ```
//!
//! The PAM glue lives in the `pam_fingerprint` crate and the enrollment
//! tool in `pam-fingerprint`; both only talk to the types re-exported here.

pub mod adapter;
pub mod audit;
pub mod config;
pub mod deadline;
pub mod decision;
pub mod error;
pub mod extract;
pub mod features;
pub mod matcher;
pub mod paths;
pub mod sample;
pub mod store;

pub use adapter::{
    Attempt, AuthContext, Conversation, FingerprintModule, Flags, IdentitySource, ModuleResult,
    Quiet, ServiceModule, State,
};
pub use audit::{AuditEvent, AuditSink, TracingAudit};
pub use config::{Config, FailureAction, Loaded};
pub use deadline::{Deadline, Expired};
pub use decision::{DecisionEngine, Verdict};
pub use error::ErrorKind;
pub use extract::{ExtractError, FeatureExtractor, RidgeExtractor};
pub use features::{FeatureSet, Minutia, MinutiaKind};
pub use matcher::{MatchScore, Matcher};
pub use sample::{CaptureError, FileSampleSource, FingerprintSample, SampleSource};
pub use store::{FsTemplateStore, LoadedTemplates, StoreError, Template, TemplateStore};
