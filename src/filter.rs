//! Sender-based filtering: the per-account worker body.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::config::MailboxLimits;
use crate::error::MailboxError;
use crate::mailbox::{Dialer, MailboxSession, Uid};
use crate::rules::{Rule, WorkGroup};
use crate::task::TaskControl;

/// Result of one `filter_mail` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// UIDs in the source folder that were moved.
    pub uids: Vec<Uid>,
}

impl FilterOutcome {
    pub fn count(&self) -> usize {
        self.uids.len()
    }
}

/// What one worker did for one account in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountReport {
    pub user: String,
    pub rules_run: usize,
    pub rules_skipped: usize,
    pub moved: usize,
    /// Set when the account's cycle was aborted.
    pub error: Option<String>,
    /// Stopped early on a cancel request.
    pub cancelled: bool,
}

impl AccountReport {
    fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Applies rules through mailbox sessions opened with one dialer.
pub struct FilterEngine {
    dialer: Arc<dyn Dialer>,
    limits: MailboxLimits,
    validate_folders: bool,
}

impl FilterEngine {
    pub fn new(dialer: Arc<dyn Dialer>, limits: MailboxLimits) -> Self {
        Self {
            dialer,
            limits,
            validate_folders: true,
        }
    }

    /// Toggle skipping rules whose folders are missing on the server.
    pub fn with_folder_validation(mut self, enabled: bool) -> Self {
        self.validate_folders = enabled;
        self
    }

    /// Move messages in `source` whose sender already appears in `target`.
    pub fn filter_mail(
        &self,
        session: &mut MailboxSession,
        source: &str,
        target: &str,
    ) -> Result<FilterOutcome, MailboxError> {
        let senders = session.list_sender_addresses(target)?;
        if senders.is_empty() {
            tracing::debug!(user = %session.user(), target, "No known senders in target folder");
            return Ok(FilterOutcome::default());
        }

        let uids = session.move_by_addresses(&senders, source, target)?;
        Ok(FilterOutcome { uids })
    }

    /// Run all rules of `group` over one session.
    ///
    /// Never fails: errors end the account's cycle and are recorded in the
    /// report. Cancellation is honoured between rules.
    pub fn run_group(&self, group: &WorkGroup, control: &TaskControl) -> AccountReport {
        let _span = tracing::info_span!("account", user = %group.user()).entered();
        let mut report = AccountReport::new(group.user());

        let mut session = MailboxSession::new(
            group.account.clone(),
            Arc::clone(&self.dialer),
            control.kill_switch().clone(),
            self.limits,
        );

        if let Err(e) = self.run_rules(&mut session, &group.rules, control, &mut report) {
            tracing::error!("Account cycle aborted: {e}");
            report.error = Some(e.to_string());
        }
        session.disconnect();

        tracing::info!(
            rules_run = report.rules_run,
            rules_skipped = report.rules_skipped,
            moved = report.moved,
            cancelled = report.cancelled,
            "Account done"
        );
        report
    }

    fn run_rules(
        &self,
        session: &mut MailboxSession,
        rules: &[Rule],
        control: &TaskControl,
        report: &mut AccountReport,
    ) -> Result<(), MailboxError> {
        session.connect()?;

        let folders: Option<HashSet<String>> = if self.validate_folders {
            Some(session.list_folders()?.into_iter().collect())
        } else {
            None
        };

        for rule in rules {
            if control.is_cancel_requested() {
                tracing::info!("Cancel requested, stopping before next rule");
                report.cancelled = true;
                return Ok(());
            }

            if let Some(folders) = &folders {
                let missing: Vec<&str> = [&rule.source_folder, &rule.target_folder]
                    .into_iter()
                    .filter(|f| !folders.contains(*f))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    tracing::warn!(rule = %rule.id, ?missing, "Folder not found on server, skipping rule");
                    report.rules_skipped += 1;
                    continue;
                }
            }

            let outcome = self.filter_mail(session, &rule.source_folder, &rule.target_folder)?;
            tracing::debug!(
                rule = %rule.id,
                source = %rule.source_folder,
                target = %rule.target_folder,
                moved = outcome.count(),
                "Rule applied"
            );
            report.rules_run += 1;
            report.moved += outcome.count();
        }
        Ok(())
    }
}
