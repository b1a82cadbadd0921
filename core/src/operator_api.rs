use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use dialcast_campaign::phone::normalize_e164;
use dialcast_campaign::types::{Campaign, CampaignStatus, Contact, ContactStatus, Priority};
use dialcast_dispatch::types::{JanitorReport, RedisStateSnapshot};
use dialcast_helpers::runtime_types::{ApiEnvelope, HealthCheckResponse};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::ApiError;
use crate::types::ApiAppState;

// Creates the router for the operator API consumed by the external
// CRUD tier: campaign lifecycle controls, bulk contact loading,
// progress counters and the maintenance surface.
pub fn create_operator_api(state: Arc<ApiAppState>) -> Router {
    Router::new()
        .route("/campaigns/{id}/start", post(start_campaign_handler))
        .route("/campaigns/{id}/pause", post(pause_campaign_handler))
        .route("/campaigns/{id}/resume", post(resume_campaign_handler))
        .route("/campaigns/{id}/cancel", post(cancel_campaign_handler))
        .route("/campaigns/{id}/contacts", post(add_contacts_handler))
        .route("/campaigns/{id}/progress", get(campaign_progress_handler))
        .route(
            "/maintenance/redis-state/{id}",
            get(redis_state_handler),
        )
        .route(
            "/maintenance/cleanup-slots/{id}",
            post(cleanup_slots_handler),
        )
        .route("/runtime/health/check", get(health_check_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn start_campaign_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<Campaign>>, ApiError> {
    let campaign = state.manager.activate(&campaign_id).await?;
    info!(campaign_id, "campaign started");
    Ok(Json(ApiEnvelope::ok(campaign)))
}

async fn pause_campaign_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<Campaign>>, ApiError> {
    let campaign = state.manager.pause(&campaign_id).await?;
    info!(campaign_id, "campaign paused");
    Ok(Json(ApiEnvelope::ok(campaign)))
}

async fn resume_campaign_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<Campaign>>, ApiError> {
    let campaign = state.manager.resume(&campaign_id).await?;
    info!(campaign_id, "campaign resumed");
    Ok(Json(ApiEnvelope::ok(campaign)))
}

async fn cancel_campaign_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<Campaign>>, ApiError> {
    let campaign = state.manager.cancel(&campaign_id).await?;
    info!(campaign_id, "campaign cancelled");
    Ok(Json(ApiEnvelope::ok(campaign)))
}

/// One contact in a bulk-add request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    pub id: Option<String>,
    pub phone_number: String,
    pub priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
pub struct AddContactsRequest {
    pub contacts: Vec<ContactInput>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AddContactsResponse {
    pub added: u64,
    /// Phone numbers rejected by E.164 validation, verbatim.
    pub rejected: Vec<String>,
}

async fn add_contacts_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
    Json(request): Json<AddContactsRequest>,
) -> Result<Json<ApiEnvelope<AddContactsResponse>>, ApiError> {
    let campaign = state.service.get_campaign(&campaign_id).await?;

    let mut added = 0;
    let mut rejected = Vec::new();
    let mut queued_entries = Vec::new();

    for input in request.contacts {
        let Some(phone_number) = normalize_e164(&input.phone_number) else {
            rejected.push(input.phone_number);
            continue;
        };

        let priority = input.priority.unwrap_or(Priority::Normal);
        let contact_id = input.id.unwrap_or_else(|| nanoid!());
        let enqueue_now = campaign.status == CampaignStatus::Active;

        state
            .service
            .upsert_contact(Contact {
                id: contact_id.clone(),
                campaign_id: campaign_id.clone(),
                phone_number,
                priority,
                status: if enqueue_now {
                    ContactStatus::Queued
                } else {
                    ContactStatus::Pending
                },
                retry_count: 0,
                next_retry_at: None,
                failure_reason: None,
                version: 1,
            })
            .await?;
        if enqueue_now {
            queued_entries.push((contact_id, priority));
        }
        added += 1;
    }

    if !queued_entries.is_empty() {
        state
            .store
            .enqueue_contacts(&campaign_id, &queued_entries, false)
            .await?;
    }

    info!(
        campaign_id,
        added,
        rejected = rejected.len(),
        "bulk contact load processed"
    );
    Ok(Json(ApiEnvelope::ok(AddContactsResponse { added, rejected })))
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignProgress {
    pub inflight: u64,
    pub reserved: u64,
    pub queued_high: u64,
    pub queued_normal: u64,
    pub completed: u64,
    pub failed: u64,
}

async fn campaign_progress_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<CampaignProgress>>, ApiError> {
    // 404 for unknown campaigns before reading scheduling state.
    state.service.get_campaign(&campaign_id).await?;

    let inflight = state.store.inflight_count(&campaign_id).await?;
    let reserved = state.store.reserved_count(&campaign_id).await?;
    let (queued_high, queued_normal) = state.store.waitlist_lengths(&campaign_id).await?;
    let completed = state
        .service
        .count_contacts_by_status(&campaign_id, ContactStatus::Completed)
        .await?;
    let failed = state
        .service
        .count_contacts_by_status(&campaign_id, ContactStatus::Failed)
        .await?;

    Ok(Json(ApiEnvelope::ok(CampaignProgress {
        inflight,
        reserved,
        queued_high,
        queued_normal,
        completed,
        failed,
    })))
}

async fn redis_state_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<RedisStateSnapshot>>, ApiError> {
    let snapshot = state.store.snapshot(&campaign_id).await?;
    Ok(Json(ApiEnvelope::ok(snapshot)))
}

async fn cleanup_slots_handler(
    State(state): State<Arc<ApiAppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<ApiEnvelope<JanitorReport>>, ApiError> {
    let report = state.maintenance.run_janitor_scan(&campaign_id).await?;
    info!(campaign_id, ?report, "on-demand janitor scan completed");
    Ok(Json(ApiEnvelope::ok(report)))
}

async fn health_check_handler(
    State(state): State<Arc<ApiAppState>>,
) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        timestamp: state.clock.now(),
    })
}
