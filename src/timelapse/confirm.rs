use crate::errors::AppError;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Handle returned by [`ConfirmBroker::propose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub token: u64,
    pub expires_in: Duration,
}

struct Pending<A> {
    action: A,
    deadline: Instant,
}

/// Two-phase confirmation: an action is parked under a token and only
/// released if it is accepted before its deadline.
pub struct ConfirmBroker<A> {
    timeout: Duration,
    next_token: AtomicU64,
    pending: Mutex<HashMap<u64, Pending<A>>>,
}

impl<A> ConfirmBroker<A> {
    pub fn new(timeout: Duration) -> Self {
        ConfirmBroker {
            timeout,
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending<A>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn propose(&self, action: A) -> Proposal {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut pending = self.lock();
        pending.retain(|_, p| p.deadline > now);
        pending.insert(
            token,
            Pending {
                action,
                deadline: now + self.timeout,
            },
        );
        debug!("Proposal #{} awaiting confirmation for {:?}.", token, self.timeout);
        Proposal {
            token,
            expires_in: self.timeout,
        }
    }

    /// Resolves a proposal. Returns the action when it was accepted in time,
    /// `None` when it was declined. Either way the token is spent.
    pub fn confirm(&self, token: u64, accepted: bool) -> Result<Option<A>, AppError> {
        let entry = self.lock().remove(&token).ok_or(AppError::UnknownProposal(token))?;
        if Instant::now() > entry.deadline {
            debug!("Proposal #{} lapsed.", token);
            return Err(AppError::ProposalLapsed(token));
        }
        Ok(accepted.then_some(entry.action))
    }

    pub fn pending_count(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|p| p.deadline > now).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn accepted_in_time_releases_action() {
        let broker = ConfirmBroker::new(Duration::from_secs(180));
        let proposal = broker.propose("delete t1");
        tokio::time::advance(Duration::from_secs(179)).await;
        assert_eq!(broker.confirm(proposal.token, true).unwrap(), Some("delete t1"));
        assert!(matches!(
            broker.confirm(proposal.token, true),
            Err(AppError::UnknownProposal(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_releases_nothing() {
        let broker = ConfirmBroker::new(Duration::from_secs(5));
        let proposal = broker.propose(1);
        assert_eq!(broker.confirm(proposal.token, false).unwrap(), None);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_lapses_after_timeout() {
        let broker = ConfirmBroker::new(Duration::from_secs(180));
        let proposal = broker.propose("rename");
        assert_eq!(broker.pending_count(), 1);
        tokio::time::advance(Duration::from_secs(181)).await;
        assert_eq!(broker.pending_count(), 0);
        assert!(matches!(
            broker.confirm(proposal.token, true),
            Err(AppError::ProposalLapsed(t)) if t == proposal.token
        ));
    }
}
