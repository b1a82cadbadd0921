use std::fmt;

use crate::types::{Campaign, CampaignStatus};

/// The error type for rejected campaign lifecycle transitions.
#[derive(Debug, PartialEq)]
pub enum LifecycleError {
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },
    /// A campaign cannot be scheduled without a `scheduled_for` time.
    MissingSchedule,
    /// A campaign cannot activate before its `scheduled_for` time
    /// has elapsed.
    ScheduleNotElapsed,
    /// A campaign cannot activate with no contacts to dial.
    NoContacts,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifecycleError::InvalidTransition { from, to } => {
                write!(f, "invalid campaign transition from {from:?} to {to:?}")
            }
            LifecycleError::MissingSchedule => {
                write!(f, "campaign cannot be scheduled without a scheduled time")
            }
            LifecycleError::ScheduleNotElapsed => {
                write!(f, "campaign scheduled time has not elapsed yet")
            }
            LifecycleError::NoContacts => {
                write!(f, "campaign has no contacts to dial")
            }
        }
    }
}

/// Returns whether the transition between the two statuses is
/// permitted by the campaign state machine, ignoring the
/// preconditions that depend on campaign data.
pub fn can_transition(from: CampaignStatus, to: CampaignStatus) -> bool {
    use CampaignStatus::*;
    match (from, to) {
        (Draft, Scheduled) => true,
        // Operators may start a draft campaign directly without
        // scheduling it first.
        (Draft, Active) => true,
        (Scheduled, Active) => true,
        (Active, Paused) => true,
        (Paused, Active) => true,
        (Active, Completed) => true,
        // Cancellation is allowed from any non-terminal state.
        (from, Cancelled) => !from.is_terminal(),
        // The reconciler may mark any campaign as failed on
        // unrecoverable corruption.
        (from, Failed) => from != Failed,
        _ => false,
    }
}

/// Validates a requested transition against the state machine and
/// the data-dependent preconditions.
///
/// `has_contacts` reports whether the campaign has any contacts that
/// are not yet terminal; activation requires at least one.
pub fn validate_transition(
    campaign: &Campaign,
    to: CampaignStatus,
    now_ms: u64,
    has_contacts: bool,
) -> Result<(), LifecycleError> {
    if !can_transition(campaign.status, to) {
        return Err(LifecycleError::InvalidTransition {
            from: campaign.status,
            to,
        });
    }

    match to {
        CampaignStatus::Scheduled => {
            if campaign.scheduled_for.is_none() {
                return Err(LifecycleError::MissingSchedule);
            }
        }
        CampaignStatus::Active if campaign.status == CampaignStatus::Scheduled => {
            if let Some(scheduled_for) = campaign.scheduled_for {
                if scheduled_for > now_ms {
                    return Err(LifecycleError::ScheduleNotElapsed);
                }
            }
            if !has_contacts {
                return Err(LifecycleError::NoContacts);
            }
        }
        _ => {}
    }

    Ok(())
}

/// The statuses from which an operator can start a campaign.
pub fn startable(status: CampaignStatus) -> bool {
    matches!(status, CampaignStatus::Draft | CampaignStatus::Scheduled)
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;
    use crate::types::{PriorityMode, RetryPolicy};

    fn campaign_in(status: CampaignStatus, scheduled_for: Option<u64>) -> Campaign {
        Campaign {
            id: "c1".to_string(),
            name: "Renewal reminders".to_string(),
            limit: 5,
            status,
            priority_mode: PriorityMode::Weighted,
            retry_policy: RetryPolicy::default(),
            agent_ref: "agent-1".to_string(),
            phone_pool_ref: "pool-1".to_string(),
            scheduled_for,
            version: 1,
        }
    }

    #[test]
    fn test_permitted_transitions() {
        use CampaignStatus::*;
        assert!(can_transition(Draft, Scheduled));
        assert!(can_transition(Draft, Active));
        assert!(can_transition(Scheduled, Active));
        assert!(can_transition(Active, Paused));
        assert!(can_transition(Paused, Active));
        assert!(can_transition(Active, Completed));
        assert!(can_transition(Paused, Cancelled));
        assert!(can_transition(Draft, Cancelled));
        assert!(can_transition(Active, Failed));
    }

    #[test]
    fn test_rejected_transitions() {
        use CampaignStatus::*;
        assert!(!can_transition(Completed, Active));
        assert!(!can_transition(Cancelled, Active));
        assert!(!can_transition(Cancelled, Cancelled));
        assert!(!can_transition(Paused, Completed));
        assert!(!can_transition(Scheduled, Paused));
        assert!(!can_transition(Failed, Failed));
    }

    #[test]
    fn test_scheduling_requires_a_scheduled_time() {
        let campaign = campaign_in(CampaignStatus::Draft, None);
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Scheduled, 1_000, true),
            Err(LifecycleError::MissingSchedule)
        );

        let campaign = campaign_in(CampaignStatus::Draft, Some(2_000));
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Scheduled, 1_000, true),
            Ok(())
        );
    }

    #[test]
    fn test_scheduled_activation_waits_for_schedule_and_contacts() {
        let campaign = campaign_in(CampaignStatus::Scheduled, Some(5_000));
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Active, 1_000, true),
            Err(LifecycleError::ScheduleNotElapsed)
        );
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Active, 5_000, false),
            Err(LifecycleError::NoContacts)
        );
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Active, 5_000, true),
            Ok(())
        );
    }

    #[test]
    fn test_resume_does_not_require_schedule_checks() {
        let campaign = campaign_in(CampaignStatus::Paused, Some(u64::MAX));
        assert_eq!(
            validate_transition(&campaign, CampaignStatus::Active, 0, false),
            Ok(())
        );
    }
}
