#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;
use vmhub_protocol::messages::CaptchaSettings;

/// Client for the external CAPTCHA provider's verify endpoint. Provider
/// failures deny the action rather than waving it through.
#[derive(Clone)]
pub struct CaptchaVerifier {
	client: reqwest::Client,
	settings: Arc<RwLock<CaptchaSettings>>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
	success: bool,
}

impl CaptchaVerifier {
	pub fn new(settings: CaptchaSettings) -> Self {
		Self {
			client: reqwest::Client::new(),
			settings: Arc::new(RwLock::new(settings)),
		}
	}

	pub fn set_settings(&self, settings: CaptchaSettings) {
		*self.settings.write() = settings;
	}

	pub async fn verify(&self, token: &str, remote_ip: &str) -> bool {
		let (enabled, verify_url, secret_key) = {
			let settings = self.settings.read();
			(settings.enabled, settings.verify_url.clone(), settings.secret_key.clone())
		};
		if !enabled {
			return true;
		}
		if token.trim().is_empty() {
			return false;
		}

		let form = [("secret", secret_key.as_str()), ("response", token), ("remoteip", remote_ip)];
		let response = match self.client.post(&verify_url).form(&form).send().await {
			Ok(r) => r,
			Err(e) => {
				warn!(error = %e, "captcha verify request failed");
				metrics::counter!("vmhub_server_captcha_errors_total").increment(1);
				return false;
			}
		};

		match response.json::<VerifyResponse>().await {
			Ok(body) => body.success,
			Err(e) => {
				warn!(error = %e, "captcha verify response malformed");
				metrics::counter!("vmhub_server_captcha_errors_total").increment(1);
				false
			}
		}
	}
}
