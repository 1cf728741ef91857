#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use ncbridge_domain::{ContentUri, SecretString};
use ncbridge_media::{SourceCleanup, TransportError};
use serde::Deserialize;
use tracing::info;

/// Deletes bridged source media from a Synapse homeserver through the admin API.
#[derive(Debug, Clone)]
pub struct SynapseAdminCleaner {
	homeserver_url: String,
	access_token: SecretString,
	client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteMediaResponse {
	#[serde(default)]
	total: u64,
}

impl SynapseAdminCleaner {
	pub fn new(
		homeserver_url: impl Into<String>,
		access_token: SecretString,
		request_timeout: Duration,
	) -> Result<Self, TransportError> {
		let client = reqwest::Client::builder().timeout(request_timeout).build()?;
		Ok(Self {
			homeserver_url: homeserver_url.into(),
			access_token,
			client,
		})
	}
}

#[async_trait]
impl SourceCleanup for SynapseAdminCleaner {
	async fn delete_source_media(&self, uri: &ContentUri) -> Result<(), TransportError> {
		let url = format!(
			"{}/_synapse/admin/v1/media/{}/{}",
			self.homeserver_url.trim_end_matches('/'),
			urlencoding::encode(&uri.server_name),
			urlencoding::encode(&uri.media_id)
		);
		let resp = self
			.client
			.delete(url)
			.header("Authorization", format!("Bearer {}", self.access_token.expose().trim()))
			.send()
			.await?;

		let status = resp.status();
		if !status.is_success() {
			let message = resp.text().await.unwrap_or_default();
			return Err(TransportError::Status {
				status: status.as_u16(),
				errcode: None,
				message,
			});
		}

		let body: DeleteMediaResponse = resp.json().await.unwrap_or_default();
		info!(%uri, deleted = body.total, "deleted source media from homeserver");
		metrics::counter!("ncbridge_source_media_deleted_total").increment(body.total);
		Ok(())
	}
}
