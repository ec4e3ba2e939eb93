//! Periodic maintenance hook driven by the host's tick loop

use crate::StandardRequestManager;
use quartermaster_core::{Request, RequestState, Token};

/// What one call to [`StandardRequestManager::on_tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Requests cancelled because their requester is no longer known
    pub orphans_cancelled: usize,
    /// Requests in `Created` when the retry pass started
    pub unresolved_retried: usize,
    /// Of those, how many a resolver took
    pub newly_resolved: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.orphans_cancelled == 0 && self.newly_resolved == 0
    }
}

impl StandardRequestManager {
    /// Run the maintenance passes enabled in the manager's config.
    ///
    /// The manager owns no schedule; the host decides how often to call this.
    pub fn on_tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.config.cancel_orphaned_on_tick {
            let orphans: Vec<Token> = self
                .requests
                .values()
                .filter(|request| self.requester_handle(request.requester()).is_none())
                .map(Request::token)
                .collect();
            for token in orphans {
                if self.requests.contains_key(&token) {
                    self.cancel_request(token, true);
                    report.orphans_cancelled += 1;
                }
            }
        }

        if self.config.retry_unresolved_on_tick {
            report.unresolved_retried = self
                .requests
                .values()
                .filter(|request| request.state() == RequestState::Created)
                .count();
            if report.unresolved_retried > 0 {
                report.newly_resolved = self.resolve_pending();
            }
        }

        if report.is_idle() {
            tracing::trace!("Request manager tick completed with nothing to do");
        } else {
            tracing::info!(
                orphans_cancelled = report.orphans_cancelled,
                unresolved_retried = report.unresolved_retried,
                newly_resolved = report.newly_resolved,
                "Request manager tick completed"
            );
        }
        report
    }
}
