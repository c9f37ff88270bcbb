//! Printer poll exchange.
//!
//! The printer POSTs a form body carrying `ConnectionType`. A `GetRequest`
//! peeks at the head of the tenant queue and gets it back as an ePOS ticket. A
//! `SetResponse` acknowledges the last ticket, which flags the record as
//! printed and drops it from the queue. Nothing is kept between polls.

use crate::epos::{format_kiln_ticket, TicketOptions};
use crate::errors::Result;
use crate::job::QueuedJob;
use crate::photo::{EncodedImage, PhotoRenderer};
use crate::queue::QueueManager;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const XML_CONTENT_TYPE: &str = "text/xml; charset=UTF-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    GetRequest,
    SetResponse,
}

impl ConnectionType {
    /// Read `ConnectionType` from a form-encoded body.
    pub fn from_form(body: &[u8]) -> Option<Self> {
        url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "ConnectionType")
            .and_then(|(_, value)| match value.as_ref() {
                "GetRequest" => Some(ConnectionType::GetRequest),
                "SetResponse" => Some(ConnectionType::SetResponse),
                _ => None,
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::GetRequest => "GetRequest",
            ConnectionType::SetResponse => "SetResponse",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollBody {
    Xml(String),
    Json(serde_json::Value),
}

/// Status and body returned to the printer
#[derive(Debug, Clone, PartialEq)]
pub struct PollReply {
    pub status: StatusCode,
    pub body: PollBody,
}

impl PollReply {
    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            body: PollBody::Json(body),
        }
    }

    pub fn invalid_connection_type() -> Self {
        Self::json(
            StatusCode::BAD_REQUEST,
            json!({ "success": false, "message": "Invalid connection type" }),
        )
    }
}

pub struct PollHandler {
    queue_manager: Arc<QueueManager>,
    photo_renderer: Arc<dyn PhotoRenderer>,
    telemetry: Arc<TelemetryCollector>,
    ticket: TicketOptions,
}

impl PollHandler {
    pub fn new(
        queue_manager: Arc<QueueManager>,
        photo_renderer: Arc<dyn PhotoRenderer>,
        telemetry: Arc<TelemetryCollector>,
        ticket: TicketOptions,
    ) -> Self {
        Self {
            queue_manager,
            photo_renderer,
            telemetry,
            ticket,
        }
    }

    /// Answer one poll for `tenant`.
    pub async fn handle(&self, tenant: &str, body: &[u8]) -> PollReply {
        let (label, reply) = match ConnectionType::from_form(body) {
            Some(ConnectionType::GetRequest) => ("GetRequest", self.get_request(tenant).await),
            Some(ConnectionType::SetResponse) => ("SetResponse", self.set_response(tenant).await),
            None => {
                warn!("Rejected poll for {} with invalid connection type", tenant);
                ("Invalid", PollReply::invalid_connection_type())
            }
        };

        self.telemetry
            .record_event(TelemetryEvent::PollServed {
                tenant: tenant.to_string(),
                connection_type: label.to_string(),
                status: reply.status.as_u16(),
            })
            .await;

        reply
    }

    async fn get_request(&self, tenant: &str) -> PollReply {
        debug!("GetRequest from {}", tenant);

        match self.render_head(tenant).await {
            Ok(Some(xml)) => PollReply {
                status: StatusCode::OK,
                body: PollBody::Xml(xml),
            },
            Ok(None) => PollReply::json(StatusCode::CREATED, json!({ "message": "No jobs in queue" })),
            Err(e) => {
                error!("GetRequest for {} failed: {}", tenant, e);
                PollReply::json(StatusCode::BAD_REQUEST, json!({ "success": false }))
            }
        }
    }

    /// Ticket for the oldest job, without removing it.
    async fn render_head(&self, tenant: &str) -> Result<Option<String>> {
        let jobs = self.queue_manager.list_jobs(tenant).await?;
        let Some(head) = jobs.into_iter().next() else {
            return Ok(None);
        };

        let photo = self.photo_for(&head).await;
        Ok(Some(format_kiln_ticket(&head.record, photo.as_ref(), &self.ticket)))
    }

    async fn photo_for(&self, job: &QueuedJob) -> Option<EncodedImage> {
        let url = job.record.photo_url.as_deref().filter(|u| !u.trim().is_empty())?;

        match self.photo_renderer.render(url).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Printing request {} without its photo: {}", job.record_id(), e);
                None
            }
        }
    }

    async fn set_response(&self, tenant: &str) -> PollReply {
        debug!("SetResponse from {}", tenant);

        match self.acknowledge_head(tenant).await {
            Ok(()) => PollReply::json(
                StatusCode::OK,
                json!({ "success": true, "message": "Processed print job successfully" }),
            ),
            Err(e) => {
                error!("SetResponse for {} failed: {}", tenant, e);
                PollReply::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "message": "Error processing print job" }),
                )
            }
        }
    }

    /// Flag and remove the oldest job. An empty queue is a successful no-op.
    async fn acknowledge_head(&self, tenant: &str) -> Result<()> {
        let jobs = self.queue_manager.list_jobs(tenant).await?;
        let Some(printed) = jobs.into_iter().next() else {
            debug!("SetResponse for {} with an empty queue", tenant);
            return Ok(());
        };

        let record_id = printed.record_id().to_string();
        self.queue_manager.remove_job(tenant, &printed, &record_id).await?;
        info!("Printer acknowledged kiln request {} for {}", record_id, tenant);
        Ok(())
    }
}
