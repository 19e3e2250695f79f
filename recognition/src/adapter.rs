//! Authentication-framework lifecycle on top of the verification core.
//!
//! [`ServiceModule`] has one method per PAM entry point; the PAM glue crate
//! forwards to it. Everything a call needs travels in an [`AuthContext`]
//! built for that call, so concurrent logins never share mutable state.
//! Whatever happens inside, a call always ends in [`State::Done`] with a
//! [`ModuleResult`]; panics are caught and become an internal fault.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{Config, FailureAction};
use crate::deadline::Deadline;
use crate::decision::{DecisionEngine, Verdict};
use crate::error::ErrorKind;
use crate::extract::{FeatureExtractor, RidgeExtractor};
use crate::features::FeatureSet;
use crate::matcher::Matcher;
use crate::sample::SampleSource;
use crate::store::{FsTemplateStore, TemplateStore};

pub const PROMPT: &str = "Waiting for finger...";
pub const RETRY_PROMPT: &str = "Please place your finger again.";
pub const GRANTED: &str = "Access granted.";
/// The only failure text users ever see.
pub const DENIED: &str = "Authentication failed.";

/// Result vocabulary of the authentication framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleResult {
    Success,
    AuthError,
    Ignore,
    CredUnavail,
    UserUnknown,
}

impl From<FailureAction> for ModuleResult {
    fn from(action: FailureAction) -> Self {
        match action {
            FailureAction::Deny => ModuleResult::AuthError,
            FailureAction::Ignore => ModuleResult::Ignore,
            FailureAction::CredUnavail => ModuleResult::CredUnavail,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub silent: bool,
}

/// Resolves who is logging in.
pub trait IdentitySource {
    fn user(&self) -> Option<String>;

    fn service(&self) -> Option<String> {
        None
    }
}

/// Text channel to the user.
pub trait Conversation {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// A conversation that says nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiet;

impl Conversation for Quiet {
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Collaborators for one invocation.
pub struct AuthContext<'a> {
    pub identity: &'a dyn IdentitySource,
    pub capture: &'a mut dyn SampleSource,
    pub conversation: &'a dyn Conversation,
    pub audit: &'a dyn AuditSink,
}

impl<'a> AuthContext<'a> {
    pub fn new(
        identity: &'a dyn IdentitySource,
        capture: &'a mut dyn SampleSource,
        conversation: &'a dyn Conversation,
        audit: &'a dyn AuditSink,
    ) -> Self {
        Self {
            identity,
            capture,
            conversation,
            audit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AwaitingIdentity,
    Verifying,
    Done,
}

impl State {
    /// `Verifying -> AwaitingIdentity` is the retry edge taken after an
    /// unusable capture.
    pub fn can_advance_to(self, next: State) -> bool {
        use State::*;
        match (self, next) {
            (Done, _) => false,
            (_, Done) => true,
            (Idle, AwaitingIdentity)
            | (AwaitingIdentity, Verifying)
            | (Verifying, AwaitingIdentity) => true,
            _ => false,
        }
    }
}

/// Progress of one `authenticate` call.
#[derive(Debug, Clone)]
pub struct Attempt {
    state: State,
    identity: Option<String>,
    verdict: Verdict,
    skipped_records: usize,
    captures: u32,
}

impl Default for Attempt {
    fn default() -> Self {
        Self {
            state: State::Idle,
            identity: None,
            verdict: Verdict::inconclusive(ErrorKind::InternalFault),
            skipped_records: 0,
            captures: 0,
        }
    }
}

impl Attempt {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn skipped_records(&self) -> usize {
        self.skipped_records
    }

    pub fn captures(&self) -> u32 {
        self.captures
    }

    fn advance(&mut self, next: State) -> Result<(), ErrorKind> {
        if self.state.can_advance_to(next) {
            debug!("attempt {:?} -> {:?}", self.state, next);
            self.state = next;
            Ok(())
        } else {
            error!("illegal transition {:?} -> {:?}", self.state, next);
            Err(ErrorKind::InternalFault)
        }
    }

    fn finish(&mut self, verdict: Verdict) {
        self.state = State::Done;
        self.verdict = verdict;
    }
}

/// One method per framework entry point. Entry points the module has no
/// business with defer to the rest of the stack.
pub trait ServiceModule {
    fn authenticate(&self, ctx: &mut AuthContext<'_>, flags: Flags) -> ModuleResult;

    fn set_credentials(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Ignore
    }

    fn manage_account(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Ignore
    }

    fn open_session(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Ignore
    }

    fn close_session(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Ignore
    }

    fn change_auth_token(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Ignore
    }
}

pub struct FingerprintModule<S, E = RidgeExtractor> {
    config: Config,
    store: S,
    extractor: E,
    engine: DecisionEngine,
}

impl FingerprintModule<FsTemplateStore, RidgeExtractor> {
    /// Module reading templates from the configured store.
    pub fn from_config(config: Config) -> Self {
        let store = FsTemplateStore::from_config(&config.store);
        let extractor = RidgeExtractor::new(config.extraction.clone());
        Self::with_extractor(config, store, extractor)
    }
}

impl<S: TemplateStore, E: FeatureExtractor> FingerprintModule<S, E> {
    pub fn with_extractor(config: Config, store: S, extractor: E) -> Self {
        let engine = DecisionEngine::new(
            Matcher::new(config.matching.clone()),
            config.matching.threshold,
            config.store.max_templates_per_identity,
        );
        Self {
            config,
            store,
            extractor,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pipeline without auditing or talking to the user about the
    /// result. The returned attempt is always `Done`.
    pub fn verify(&self, ctx: &mut AuthContext<'_>, flags: Flags) -> Attempt {
        let deadline = Deadline::after(self.config.policy.timeout());
        let mut attempt = Attempt::default();

        let verdict = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run(ctx, &mut attempt, flags, &deadline)
        }))
        .unwrap_or_else(|_| {
            error!("verification pipeline panicked");
            Verdict::inconclusive(ErrorKind::InternalFault)
        });

        attempt.finish(verdict);
        attempt
    }

    fn run(
        &self,
        ctx: &mut AuthContext<'_>,
        attempt: &mut Attempt,
        flags: Flags,
        deadline: &Deadline,
    ) -> Verdict {
        macro_rules! step {
            ($next:expr) => {
                if let Err(kind) = attempt.advance($next) {
                    return Verdict::inconclusive(kind);
                }
            };
        }

        step!(State::AwaitingIdentity);
        let Some(identity) = ctx.identity.user() else {
            return Verdict::inconclusive(ErrorKind::UnknownUser);
        };
        attempt.identity = Some(identity.clone());

        let loaded = match self.store.load_templates(&identity, deadline) {
            Ok(loaded) => loaded,
            Err(err) => {
                info!(identity = ?identity, "no usable templates: {err}");
                return Verdict::inconclusive(err.kind());
            }
        };
        attempt.skipped_records = loaded.skipped;

        let mut last = ErrorKind::EmptyCapture;
        for round in 1..=self.config.policy.max_attempts {
            if deadline.expired() {
                return Verdict::inconclusive(ErrorKind::Timeout);
            }
            if !flags.silent {
                ctx.conversation
                    .info(if round == 1 { PROMPT } else { RETRY_PROMPT });
            }
            attempt.captures = round;

            let features = self.capture_features(ctx, deadline);
            step!(State::Verifying);

            match features {
                Ok(features) => {
                    if deadline.expired() {
                        return Verdict::inconclusive(ErrorKind::Timeout);
                    }
                    return self.engine.decide(&features, &loaded.templates, deadline);
                }
                Err(kind) if kind.is_retryable() => {
                    debug!("capture {round} unusable: {kind}");
                    last = kind;
                    step!(State::AwaitingIdentity);
                }
                Err(kind) => return Verdict::inconclusive(kind),
            }
        }

        Verdict::inconclusive(last)
    }

    /// Captures one sample and reduces it to features; the sample is
    /// dropped before this returns.
    fn capture_features(
        &self,
        ctx: &mut AuthContext<'_>,
        deadline: &Deadline,
    ) -> Result<FeatureSet, ErrorKind> {
        let sample = ctx.capture.capture(deadline).map_err(|err| {
            warn!("capture failed: {err}");
            err.kind()
        })?;
        if deadline.expired() {
            return Err(ErrorKind::Timeout);
        }
        self.extractor
            .extract(&sample, deadline)
            .map_err(|err| err.kind())
    }

    /// Verdict to framework result. Only `Accept` maps to success.
    pub fn map_verdict(&self, verdict: &Verdict) -> ModuleResult {
        let policy = &self.config.policy;
        match verdict {
            Verdict::Accept { .. } => ModuleResult::Success,
            Verdict::Reject { .. } => ModuleResult::AuthError,
            Verdict::Inconclusive { kind } => match kind {
                ErrorKind::NotEnrolled => policy.not_enrolled.into(),
                ErrorKind::UnknownUser => ModuleResult::UserUnknown,
                ErrorKind::SensorUnavailable => policy.on_sensor_unavailable.into(),
                _ => policy.on_error.into(),
            },
        }
    }
}

impl<S: TemplateStore, E: FeatureExtractor> ServiceModule for FingerprintModule<S, E> {
    fn authenticate(&self, ctx: &mut AuthContext<'_>, flags: Flags) -> ModuleResult {
        let attempt = self.verify(ctx, flags);
        let result = self.map_verdict(attempt.verdict());

        let event = AuditEvent::new(
            attempt.identity.clone(),
            ctx.identity.service(),
            attempt.verdict(),
            attempt.skipped_records,
            attempt.captures,
        );
        ctx.audit.record(&event);

        if !flags.silent {
            match result {
                ModuleResult::Success => ctx.conversation.info(GRANTED),
                ModuleResult::AuthError | ModuleResult::UserUnknown => {
                    ctx.conversation.error(DENIED)
                }
                ModuleResult::Ignore | ModuleResult::CredUnavail => {}
            }
        }

        result
    }

    /// No credentials to establish; present so the module can sit in the
    /// `auth` stack.
    fn set_credentials(&self, _ctx: &mut AuthContext<'_>, _flags: Flags) -> ModuleResult {
        ModuleResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use State::*;
        assert!(Idle.can_advance_to(AwaitingIdentity));
        assert!(AwaitingIdentity.can_advance_to(Verifying));
        assert!(Verifying.can_advance_to(AwaitingIdentity));
        assert!(Idle.can_advance_to(Done));
        assert!(Verifying.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Verifying));
        assert!(!Done.can_advance_to(Idle));
        assert!(!Done.can_advance_to(Done));
    }

    #[test]
    fn fresh_attempt_fails_closed() {
        let attempt = Attempt::default();
        assert_eq!(attempt.state(), State::Idle);
        assert_eq!(attempt.verdict().kind(), Some(ErrorKind::InternalFault));
    }

    #[test]
    fn failure_actions_never_succeed() {
        for action in [FailureAction::Deny, FailureAction::Ignore, FailureAction::CredUnavail] {
            assert_ne!(ModuleResult::from(action), ModuleResult::Success);
        }
    }
}
