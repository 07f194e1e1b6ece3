//! HTTP egress: POST/PUT JSON bodies.

use async_trait::async_trait;
use fluxgate_core::{AuthConfig, Forward, ForwardError, TargetSystem};
use reqwest::Method;
use serde_json::Value;

use crate::error::GatewayError;

/// JSON-over-HTTP emitter.
///
/// A batch of one is sent as a single JSON object; larger batches go out as
/// a JSON array in one request.
pub struct HttpForwarder {
    name: String,
    client: reqwest::Client,
    url: String,
    method: Method,
    auth: Option<AuthConfig>,
}

impl HttpForwarder {
    /// Build the emitter from the target's endpoint fields.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TargetConfig`] when the address is missing or the
    /// method is not POST/PUT.
    pub fn build(target: &TargetSystem) -> Result<Self, GatewayError> {
        let address = target.address.as_deref().ok_or_else(|| {
            GatewayError::TargetConfig(format!("target `{}` has no address", target.name))
        })?;

        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else if let Some(port) = target.port {
            format!("http://{address}:{port}")
        } else {
            format!("http://{address}")
        };
        let url = match target.path.as_deref() {
            Some(path) => format!("{}{path}", base.trim_end_matches('/')),
            None => base,
        };

        let method = match target.forwarder.method.as_deref() {
            None | Some("POST" | "post") => Method::POST,
            Some("PUT" | "put") => Method::PUT,
            Some(other) => {
                return Err(GatewayError::TargetConfig(format!(
                    "unsupported HTTP method `{other}` for target `{}`",
                    target.name
                )));
            },
        };

        Ok(Self {
            name: target.name.clone(),
            client: reqwest::Client::new(),
            url,
            method,
            auth: target.forwarder.auth.clone(),
        })
    }

    /// Resolved request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify(error: &reqwest::Error) -> ForwardError {
    if error.is_timeout() {
        ForwardError::Timeout
    } else {
        ForwardError::Connection(error.to_string())
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError> {
        let mut request = self.client.request(self.method.clone(), &self.url);

        request = match &self.auth {
            Some(AuthConfig::Bearer { token }) => request.bearer_auth(token),
            Some(AuthConfig::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            },
            Some(AuthConfig::Header { name, value }) => request.header(name, value),
            None => request,
        };

        request = match batch {
            [single] => request.json(single),
            many => request.json(many),
        };

        let response = request.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        let code = status.as_u16();

        if status.is_success() {
            Ok(Some(code))
        } else if status.is_server_error() {
            Err(ForwardError::Remote5xx(code))
        } else {
            Err(ForwardError::Remote4xx(code))
        }
    }
}
