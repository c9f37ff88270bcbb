use crate::errors::{QueueError, Result};
use crate::hook::CompletionHook;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, error, info, warn};
use url::Url;

const KILN_REQUESTS_TABLE: &str = "kiln_requests";

/// PostgREST client for the permanent `kiln_requests` table.
///
/// Uses the service role key, so it bypasses row level security. The tenant
/// filter is still applied to every update.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(supabase_url: String, service_role_key: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        // Remove trailing slash from URL
        let base_url = supabase_url.trim_end_matches('/').to_string();

        info!("Initialized Supabase client: {}", base_url);

        Self {
            client,
            base_url,
            service_role_key,
        }
    }

    fn table_url(&self, record_id: &str, tenant: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, KILN_REQUESTS_TABLE))
            .map_err(|e| QueueError::Config(format!("Invalid Supabase URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{}", record_id))
            .append_pair("account_id", &format!("eq.{}", tenant));

        Ok(url)
    }

    /// Set `printed = true` on one kiln request row.
    pub async fn mark_request_printed(&self, tenant: &str, record_id: &str) -> Result<()> {
        let url = self.table_url(record_id, tenant)?;

        debug!("Marking kiln request {} as printed", record_id);

        let response = self
            .client
            .patch(url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(&json!({ "printed": true }))
            .send()
            .await
            .map_err(|e| {
                warn!("Mark printed request failed: {}", e);
                QueueError::HookUnavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Mark printed failed: {} - {}", status, body);

            // Gateway and rate limit errors clear up on their own
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(QueueError::HookUnavailable(format!("{} - {}", status, body)));
            }
            return Err(QueueError::CompletionHook(format!("{} - {}", status, body)));
        }

        info!("Kiln request {} marked as printed", record_id);
        Ok(())
    }
}

#[async_trait]
impl CompletionHook for SupabaseClient {
    async fn mark_printed(&self, tenant: &str, record_id: &str) -> Result<()> {
        self.mark_request_printed(tenant, record_id).await
    }
}
