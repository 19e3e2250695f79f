#[macro_use]
extern crate pamsm;

use std::panic::{self, AssertUnwindSafe};

use pamsm::{LogLvl, Pam, PamError, PamFlags, PamLibExt, PamMsgStyle, PamServiceModule};
use recognition::{
    AuditEvent, AuditSink, AuthContext, Config, Conversation, FileSampleSource, FingerprintModule,
    Flags, FsTemplateStore, IdentitySource, ModuleResult, ServiceModule,
};

// auth [success=done default=ignore] pam_fingerprint.so threshold=0.6 timeout_ms=10000
struct PamFingerprint;

struct PamIdentity<'a>(&'a Pam);

impl IdentitySource for PamIdentity<'_> {
    fn user(&self) -> Option<String> {
        match self.0.get_user(None) {
            Ok(Some(user)) => user.to_str().ok().map(str::to_owned),
            _ => None,
        }
    }

    fn service(&self) -> Option<String> {
        match self.0.get_service() {
            Ok(Some(service)) => service.to_str().ok().map(str::to_owned),
            _ => None,
        }
    }
}

struct PamConversation<'a>(&'a Pam);

impl PamConversation<'_> {
    fn send(&self, message: &str, style: PamMsgStyle) {
        if let Err(err) = self.0.conv(Some(message), style) {
            let _ = self.0.syslog(LogLvl::WARNING, &conversation_failure(err));
        }
    }
}

impl Conversation for PamConversation<'_> {
    fn info(&self, message: &str) {
        self.send(message, PamMsgStyle::TEXT_INFO);
    }

    fn error(&self, message: &str) {
        self.send(message, PamMsgStyle::ERROR_MSG);
    }
}

fn conversation_failure(err: PamError) -> String {
    format!("pam_fingerprint: conversation failed: {err:?}")
}

struct SyslogAudit<'a>(&'a Pam);

impl AuditSink for SyslogAudit<'_> {
    fn record(&self, event: &AuditEvent) {
        let level = if event.is_accept() {
            LogLvl::INFO
        } else {
            LogLvl::NOTICE
        };
        let _ = self.0.syslog(level, &format!("pam_fingerprint: {event}"));
    }
}

fn to_pam(result: ModuleResult) -> PamError {
    match result {
        ModuleResult::Success => PamError::SUCCESS,
        ModuleResult::AuthError => PamError::AUTH_ERR,
        ModuleResult::Ignore => PamError::IGNORE,
        ModuleResult::CredUnavail => PamError::CRED_UNAVAIL,
        ModuleResult::UserUnknown => PamError::USER_UNKNOWN,
    }
}

/// Loads configuration for this invocation and hands `entry` a ready
/// module and context. Panics anywhere below end as `AUTH_ERR`.
fn dispatch<F>(pamh: &Pam, flags: PamFlags, args: &[String], entry: F) -> PamError
where
    F: FnOnce(&FingerprintModule<FsTemplateStore>, &mut AuthContext<'_>, Flags) -> ModuleResult,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let loaded = Config::load_system(args);
        for warning in &loaded.warnings {
            let _ = pamh.syslog(LogLvl::WARNING, &format!("pam_fingerprint: {warning}"));
        }
        let config = loaded.config;

        let mut capture = FileSampleSource::from_config(&config.capture);
        let module = FingerprintModule::from_config(config);

        let identity = PamIdentity(pamh);
        let conversation = PamConversation(pamh);
        let audit = SyslogAudit(pamh);
        let mut ctx = AuthContext::new(&identity, &mut capture, &conversation, &audit);

        let flags = Flags {
            silent: flags.contains(PamFlags::SILENT),
        };
        entry(&module, &mut ctx, flags)
    }));

    match outcome {
        Ok(result) => to_pam(result),
        Err(_) => {
            let _ = pamh.syslog(LogLvl::WARNING, "pam_fingerprint: internal fault");
            PamError::AUTH_ERR
        }
    }
}

impl PamServiceModule for PamFingerprint {
    fn authenticate(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.authenticate(ctx, flags)
        })
    }

    fn setcred(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.set_credentials(ctx, flags)
        })
    }

    fn acct_mgmt(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.manage_account(ctx, flags)
        })
    }

    fn open_session(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.open_session(ctx, flags)
        })
    }

    fn close_session(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.close_session(ctx, flags)
        })
    }

    fn chauthtok(pamh: Pam, flags: PamFlags, args: Vec<String>) -> PamError {
        dispatch(&pamh, flags, &args, |module, ctx, flags| {
            module.change_auth_token(ctx, flags)
        })
    }
}

pam_module!(PamFingerprint);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_success_maps_to_pam_success() {
        for result in [
            ModuleResult::AuthError,
            ModuleResult::Ignore,
            ModuleResult::CredUnavail,
            ModuleResult::UserUnknown,
        ] {
            assert!(!matches!(to_pam(result), PamError::SUCCESS));
        }
        assert!(matches!(to_pam(ModuleResult::Success), PamError::SUCCESS));
    }

    #[test]
    fn conversation_failure_names_the_error() {
        let line = conversation_failure(PamError::CONV_ERR);
        assert!(line.starts_with("pam_fingerprint: conversation failed"));
        assert!(line.contains("CONV_ERR"));
    }
}
