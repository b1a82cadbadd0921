use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::{error::Error, fmt::Debug};

use async_trait::async_trait;

use crate::types::{
    CallLog, Campaign, CampaignStatus, Contact, ContactStatus, RetryAttempt, RetryAttemptStatus,
};

/// A trait for the durable store that holds campaigns, contacts,
/// call logs and retry attempts.
/// Redis only holds transient scheduling state; this service is
/// the source of truth that the reconciler rebuilds from.
#[async_trait]
pub trait CampaignService {
    /// Saves a campaign, replacing any existing campaign with the same id.
    async fn upsert_campaign(&self, campaign: Campaign) -> Result<Campaign, CampaignServiceError>;

    /// Retrieves a campaign by id.
    async fn get_campaign(&self, id: &str) -> Result<Campaign, CampaignServiceError>;

    /// Retrieves all campaigns currently in the provided status.
    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, CampaignServiceError>;

    /// Transitions a campaign's status with compare-and-set semantics.
    /// The update succeeds when the current status is one of `expected`,
    /// bumping the campaign version. When the campaign is already in the
    /// target status the call is a no-op success, making the operation
    /// idempotent on state and version.
    async fn update_campaign_status(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        new_status: CampaignStatus,
    ) -> Result<Campaign, CampaignServiceError>;

    /// Saves a contact, replacing any existing contact with the same id.
    async fn upsert_contact(&self, contact: Contact) -> Result<Contact, CampaignServiceError>;

    /// Retrieves a contact by id.
    async fn get_contact(&self, id: &str) -> Result<Contact, CampaignServiceError>;

    /// Updates a contact's status, setting or clearing the failure reason.
    /// Setting the status a contact already holds is a no-op success.
    async fn update_contact_status(
        &self,
        id: &str,
        status: ContactStatus,
        failure_reason: Option<String>,
    ) -> Result<Contact, CampaignServiceError>;

    /// Records the retry bookkeeping for a contact after a retry has
    /// been scheduled or exhausted.
    async fn record_contact_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: Option<u64>,
    ) -> Result<Contact, CampaignServiceError>;

    /// Retrieves all contacts in a campaign with the provided status.
    async fn list_contacts_by_status(
        &self,
        campaign_id: &str,
        status: ContactStatus,
    ) -> Result<Vec<Contact>, CampaignServiceError>;

    /// Counts the contacts in a campaign with the provided status.
    async fn count_contacts_by_status(
        &self,
        campaign_id: &str,
        status: ContactStatus,
    ) -> Result<u64, CampaignServiceError>;

    /// Appends a call log entry for a completed call attempt.
    async fn save_call_log(&self, call_log: CallLog) -> Result<CallLog, CampaignServiceError>;

    /// Records a scheduled retry so operators can inspect the
    /// retry chain for a contact.
    async fn save_retry_attempt(
        &self,
        attempt: RetryAttempt,
    ) -> Result<RetryAttempt, CampaignServiceError>;

    /// Updates the status of a previously recorded retry attempt.
    async fn update_retry_attempt_status(
        &self,
        id: &str,
        status: RetryAttemptStatus,
    ) -> Result<RetryAttempt, CampaignServiceError>;

    /// Retrieves all retry attempts for a campaign in the provided status.
    async fn list_retry_attempts_by_status(
        &self,
        campaign_id: &str,
        status: RetryAttemptStatus,
    ) -> Result<Vec<RetryAttempt>, CampaignServiceError>;
}

impl Debug for dyn CampaignService + Send + Sync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CampaignService")
    }
}

/// The error type used for campaign service implementations.
#[derive(Debug)]
pub enum CampaignServiceError {
    NotFound(String),
    /// A compare-and-set update observed a state other than
    /// the expected one.
    Conflict {
        id: String,
        current: CampaignStatus,
    },
    InternalError(Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for CampaignServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CampaignServiceError::NotFound(id) => {
                write!(f, "record \"{id}\" not found")
            }
            CampaignServiceError::Conflict { id, current } => {
                write!(
                    f,
                    "campaign \"{id}\" status update conflict, current status is {current:?}"
                )
            }
            CampaignServiceError::InternalError(error) => {
                write!(f, "internal error: {error}")
            }
        }
    }
}

/// An in-memory implementation of the `CampaignService` trait.
/// This is intended to be used in test and sandbox environments;
/// this should not be used in production.
#[derive(Default)]
pub struct MemoryCampaignService {
    campaigns: Arc<RwLock<HashMap<String, Campaign>>>,
    contacts: Arc<RwLock<HashMap<String, Contact>>>,
    call_logs: Arc<RwLock<Vec<CallLog>>>,
    retry_attempts: Arc<RwLock<HashMap<String, RetryAttempt>>>,
}

impl MemoryCampaignService {
    /// Creates a new `MemoryCampaignService` instance.
    pub fn new() -> Self {
        MemoryCampaignService::default()
    }

    /// Returns all call logs recorded so far, used by tests to make
    /// assertions about completed attempts.
    pub fn call_logs(&self) -> Vec<CallLog> {
        self.call_logs
            .read()
            .expect("lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl CampaignService for MemoryCampaignService {
    async fn upsert_campaign(&self, campaign: Campaign) -> Result<Campaign, CampaignServiceError> {
        self.campaigns
            .write()
            .expect("lock should not be poisoned")
            .insert(campaign.id.clone(), campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: &str) -> Result<Campaign, CampaignServiceError> {
        match self
            .campaigns
            .read()
            .expect("lock should not be poisoned")
            .get(id)
        {
            Some(campaign) => Ok(campaign.clone()),
            None => Err(CampaignServiceError::NotFound(id.to_string())),
        }
    }

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, CampaignServiceError> {
        let campaigns = self.campaigns.read().expect("lock should not be poisoned");
        Ok(campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn update_campaign_status(
        &self,
        id: &str,
        expected: &[CampaignStatus],
        new_status: CampaignStatus,
    ) -> Result<Campaign, CampaignServiceError> {
        let mut campaigns = self.campaigns.write().expect("lock should not be poisoned");
        let campaign = campaigns
            .get_mut(id)
            .ok_or_else(|| CampaignServiceError::NotFound(id.to_string()))?;

        if campaign.status == new_status {
            return Ok(campaign.clone());
        }

        if !expected.contains(&campaign.status) {
            return Err(CampaignServiceError::Conflict {
                id: id.to_string(),
                current: campaign.status,
            });
        }

        campaign.status = new_status;
        campaign.version += 1;
        Ok(campaign.clone())
    }

    async fn upsert_contact(&self, contact: Contact) -> Result<Contact, CampaignServiceError> {
        self.contacts
            .write()
            .expect("lock should not be poisoned")
            .insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn get_contact(&self, id: &str) -> Result<Contact, CampaignServiceError> {
        match self
            .contacts
            .read()
            .expect("lock should not be poisoned")
            .get(id)
        {
            Some(contact) => Ok(contact.clone()),
            None => Err(CampaignServiceError::NotFound(id.to_string())),
        }
    }

    async fn update_contact_status(
        &self,
        id: &str,
        status: ContactStatus,
        failure_reason: Option<String>,
    ) -> Result<Contact, CampaignServiceError> {
        let mut contacts = self.contacts.write().expect("lock should not be poisoned");
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| CampaignServiceError::NotFound(id.to_string()))?;

        if contact.status != status {
            contact.status = status;
            contact.version += 1;
        }
        contact.failure_reason = failure_reason;
        Ok(contact.clone())
    }

    async fn record_contact_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: Option<u64>,
    ) -> Result<Contact, CampaignServiceError> {
        let mut contacts = self.contacts.write().expect("lock should not be poisoned");
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| CampaignServiceError::NotFound(id.to_string()))?;

        contact.retry_count = retry_count;
        contact.next_retry_at = next_retry_at;
        contact.version += 1;
        Ok(contact.clone())
    }

    async fn list_contacts_by_status(
        &self,
        campaign_id: &str,
        status: ContactStatus,
    ) -> Result<Vec<Contact>, CampaignServiceError> {
        let contacts = self.contacts.read().expect("lock should not be poisoned");
        Ok(contacts
            .values()
            .filter(|c| c.campaign_id == campaign_id && c.status == status)
            .cloned()
            .collect())
    }

    async fn count_contacts_by_status(
        &self,
        campaign_id: &str,
        status: ContactStatus,
    ) -> Result<u64, CampaignServiceError> {
        let contacts = self.contacts.read().expect("lock should not be poisoned");
        Ok(contacts
            .values()
            .filter(|c| c.campaign_id == campaign_id && c.status == status)
            .count() as u64)
    }

    async fn save_call_log(&self, call_log: CallLog) -> Result<CallLog, CampaignServiceError> {
        self.call_logs
            .write()
            .expect("lock should not be poisoned")
            .push(call_log.clone());
        Ok(call_log)
    }

    async fn save_retry_attempt(
        &self,
        attempt: RetryAttempt,
    ) -> Result<RetryAttempt, CampaignServiceError> {
        self.retry_attempts
            .write()
            .expect("lock should not be poisoned")
            .insert(attempt.id.clone(), attempt.clone());
        Ok(attempt)
    }

    async fn update_retry_attempt_status(
        &self,
        id: &str,
        status: RetryAttemptStatus,
    ) -> Result<RetryAttempt, CampaignServiceError> {
        let mut attempts = self
            .retry_attempts
            .write()
            .expect("lock should not be poisoned");
        let attempt = attempts
            .get_mut(id)
            .ok_or_else(|| CampaignServiceError::NotFound(id.to_string()))?;
        attempt.status = status;
        Ok(attempt.clone())
    }

    async fn list_retry_attempts_by_status(
        &self,
        campaign_id: &str,
        status: RetryAttemptStatus,
    ) -> Result<Vec<RetryAttempt>, CampaignServiceError> {
        let attempts = self
            .retry_attempts
            .read()
            .expect("lock should not be poisoned");
        Ok(attempts
            .values()
            .filter(|a| a.campaign_id == campaign_id && a.status == status)
            .cloned()
            .collect())
    }
}
