//! Credential proxy: outbound third-party API calls made server-side so
//! plaintext credentials never reach the LLM or the client in usable
//! form.
//!
//! The blob comes from the client verbatim (it is opaque there), the
//! target host is checked against the blob's domain *before* any key
//! derivation, and the decrypted value lives only for the duration of
//! one HTTPS request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dotbot_domain::error::{Error, Result};
use dotbot_protocol::{AgentRequest, ProxyDescriptor, ServerPayload};

use crate::channel::pending::PendingMap;
use crate::channel::session::SessionRegistry;

use super::crypto::{blob_domain, CredentialCipher};

/// Result handed back over the channel (and to the tool loop).
#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub ok: bool,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl ProxyResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: None,
            headers: HashMap::new(),
            body: None,
            error: Some(error.into()),
        }
    }
}

pub struct CredentialProxy {
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingMap>,
    pub cipher: Arc<CredentialCipher>,
    pub http: reqwest::Client,
}

impl CredentialProxy {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingMap>,
        cipher: Arc<CredentialCipher>,
    ) -> Self {
        Self {
            sessions,
            pending,
            cipher,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("static reqwest client config is valid"),
        }
    }

    pub async fn call(
        &self,
        device_id: &str,
        key_name: &str,
        descriptor: &ProxyDescriptor,
    ) -> ProxyResult {
        // 1. Fetch the blob from the device's vault.
        let blob = match self.fetch_blob(device_id, key_name).await {
            Ok(b) => b,
            Err(e) => return ProxyResult::failure(e.to_string()),
        };

        // 2. Verify the target host against the blob's domain before
        //    touching key material.
        let host = match target_host(&descriptor.base_url) {
            Ok(h) => h,
            Err(e) => return ProxyResult::failure(e.to_string()),
        };
        if let Err(e) = check_domain(&blob, &host) {
            return ProxyResult::failure(e.to_string());
        }

        // 3. Decrypt (belt and suspenders: the request domain rides along).
        let plaintext = match self.cipher.decrypt(&blob, Some(&host)) {
            Ok(p) => p,
            Err(e) => return ProxyResult::failure(e.to_string()),
        };

        // 4. Build and send the request with the credential injected.
        let url = format!(
            "{}{}",
            descriptor.base_url.trim_end_matches('/'),
            descriptor.path
        );
        let method = match descriptor.method.to_uppercase().parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => return ProxyResult::failure(format!("bad method '{}'", descriptor.method)),
        };
        let mut request = self.http.request(method, &url);
        for (k, v) in &descriptor.headers {
            request = request.header(k, v);
        }
        request = request.header(
            &descriptor.placement.header,
            format!("{}{}", descriptor.placement.prefix, plaintext),
        );
        if let Some(body) = &descriptor.body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect();
                let body = response.text().await.ok();
                ProxyResult {
                    ok: (200..300).contains(&status),
                    status: Some(status),
                    headers,
                    body,
                    error: None,
                }
            }
            Err(e) => ProxyResult::failure(format!("request failed: {e}")),
        }
    }

    async fn fetch_blob(&self, device_id: &str, key_name: &str) -> Result<String> {
        let result = self
            .pending
            .call(
                &self.sessions,
                device_id,
                |correlation_id| {
                    ServerPayload::VaultRequest(AgentRequest {
                        correlation_id,
                        name: Some(key_name.to_string()),
                        args: None,
                    })
                },
                Duration::from_secs(30),
            )
            .await;
        result
            .and_then(|r| r.result)
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| {
                Error::Tool {
                    tool: "credential.proxy".into(),
                    message: format!("vault has no credential named '{key_name}'"),
                }
            })
    }
}

/// Lowercased host of the proxied base URL.
fn target_host(base_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| Error::Tool {
            tool: "credential.proxy".into(),
            message: format!("bad base_url: {e}"),
        })?;
    url.host_str()
        .map(|h| h.to_lowercase())
        .ok_or_else(|| Error::Tool {
            tool: "credential.proxy".into(),
            message: "base_url has no host".into(),
        })
}

/// Exact lowercase host-vs-blob-domain check. Never retried with any
/// other domain.
fn check_domain(blob: &str, host: &str) -> Result<()> {
    let domain = blob_domain(blob)?;
    if domain != host {
        return Err(Error::DomainMismatch(format!(
            "credential is scoped to '{domain}', request targets '{host}'"
        )));
    }
    Ok(())
}
