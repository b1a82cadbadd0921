use std::fmt;

use dialcast_campaign::service::CampaignServiceError;
use redis::RedisError;

use crate::carrier::CarrierError;

/// The error type used throughout the dispatch crate for failures
/// in scheduling, admission and call placement.
#[derive(Debug)]
pub enum DispatchError {
    /// A Redis transport or command error. Callers retry these with
    /// bounded backoff before giving up.
    Redis(RedisError),
    /// A Lua script returned a value outside its contract. This is
    /// fatal for the current dispatcher task; the reconciler will
    /// reissue affected contacts.
    ScriptContract(String),
    /// A carrier request failed.
    Carrier(CarrierError),
    /// The durable store rejected or failed an operation.
    Service(CampaignServiceError),
    /// This worker lost the ownership key for a campaign and must
    /// stop driving it.
    OwnershipLost(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Redis(redis_error) => {
                write!(f, "dispatch error: redis: {redis_error}")
            }
            DispatchError::ScriptContract(detail) => {
                write!(f, "dispatch error: script contract violation: {detail}")
            }
            DispatchError::Carrier(carrier_error) => {
                write!(f, "dispatch error: carrier: {carrier_error}")
            }
            DispatchError::Service(service_error) => {
                write!(f, "dispatch error: durable store: {service_error}")
            }
            DispatchError::OwnershipLost(campaign_id) => {
                write!(
                    f,
                    "dispatch error: ownership of campaign \"{campaign_id}\" was lost"
                )
            }
        }
    }
}

impl From<RedisError> for DispatchError {
    fn from(error: RedisError) -> Self {
        DispatchError::Redis(error)
    }
}

impl From<CarrierError> for DispatchError {
    fn from(error: CarrierError) -> Self {
        DispatchError::Carrier(error)
    }
}

impl From<CampaignServiceError> for DispatchError {
    fn from(error: CampaignServiceError) -> Self {
        DispatchError::Service(error)
    }
}
