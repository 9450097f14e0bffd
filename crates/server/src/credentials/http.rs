//! The credential entry web surface.
//!
//! Three routes: the entry form (GET, token in the path), the submit
//! endpoint (POST, consumes the session atomically), and a minimal
//! landing page. Every response carries a strict CSP — nothing loads
//! besides the styling CDN, and the pages cannot be framed.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Form, Path, State};
use axum::http::header::{HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;

use dotbot_protocol::{CredentialStored, ServerEnvelope, ServerPayload};

use crate::state::SharedState;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/credentials/enter/:token", get(enter_page))
        .route("/credentials/submit", post(submit))
        .route("/credentials/session", get(landing_page))
}

fn strict_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'none'; style-src https://cdn.simplecss.org 'unsafe-inline'; \
             form-action 'self'; frame-ancestors 'none'",
        ),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers
}

// ── Pages ──────────────────────────────────────────────────────────

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title>\
         <link rel=\"stylesheet\" href=\"https://cdn.simplecss.org/simple.min.css\">\
         </head><body><main>{body}</main></body></html>"
    )
}

pub(crate) fn entry_form_html(token: &str, title: &str, prompt: &str, domain: &str) -> String {
    page(
        title,
        &format!(
            "<h1>{}</h1><p>{}</p>\
             <p><small>This value will only ever be used with <code>{}</code>.</small></p>\
             <form method=\"post\" action=\"/credentials/submit\">\
             <input type=\"hidden\" name=\"token\" value=\"{}\">\
             <input type=\"password\" name=\"value\" autofocus autocomplete=\"off\" required>\
             <button type=\"submit\">Save</button></form>",
            escape(title),
            escape(prompt),
            escape(domain),
            escape(token),
        ),
    )
}

fn success_html() -> String {
    page(
        "Saved",
        "<h1>Saved</h1><p>Your credential is stored. You can close this tab.</p>",
    )
}

fn expired_html() -> String {
    page(
        "Link expired",
        "<h1>Link expired</h1><p>This entry link was already used or has expired. \
         Ask your agent for a fresh one.</p>",
    )
}

fn rate_limited_html() -> String {
    page(
        "Try again later",
        "<h1>Too many attempts</h1><p>Please try again later.</p>",
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── Handlers ───────────────────────────────────────────────────────

async fn enter_page(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let now = Utc::now();
    match state.entry_sessions.peek(&token, now) {
        Some(session) => (
            strict_headers(),
            Html(entry_form_html(
                &token,
                &session.title,
                &session.prompt,
                &session.allowed_domain,
            )),
        ),
        None => (strict_headers(), Html(expired_html())),
    }
}

#[derive(Deserialize)]
struct SubmitForm {
    token: String,
    value: String,
}

async fn submit(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(form): Form<SubmitForm>,
) -> impl IntoResponse {
    let now = Utc::now();
    let ip = addr.ip().to_string();

    if state.entry_limiter.is_limited(&ip, now) {
        return (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            strict_headers(),
            Html(rate_limited_html()),
        );
    }

    // Atomic get-and-consume: the losing POST of a race lands here with
    // `None` and gets the expired page.
    let Some(session) = state.entry_sessions.consume(&form.token, now) else {
        state.entry_limiter.record_failure(&ip, now);
        return (
            axum::http::StatusCode::GONE,
            strict_headers(),
            Html(expired_html()),
        );
    };

    let blob = match state.cipher.encrypt(
        &form.value,
        &session.user_id,
        &session.allowed_domain,
    ) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "credential encryption failed");
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                strict_headers(),
                Html(expired_html()),
            );
        }
    };

    // Hand the blob to the device's vault.
    if let Some(sink) = state.sessions.get_sink(&session.device_id) {
        let _ = sink
            .send(ServerEnvelope::new(ServerPayload::CredentialStored(
                CredentialStored {
                    key_name: session.key_name.clone(),
                    encrypted_blob: blob,
                },
            )))
            .await;
    } else {
        tracing::warn!(
            device_id = %session.device_id,
            key_name = %session.key_name,
            "device offline; credential entry lost"
        );
    }

    tracing::info!(key_name = %session.key_name, "credential stored");
    (
        axum::http::StatusCode::OK,
        strict_headers(),
        Html(success_html()),
    )
}

async fn landing_page() -> impl IntoResponse {
    (
        strict_headers(),
        Html(page(
            "DotBot",
            "<h1>DotBot</h1><p>This server talks to your local agent. \
             There is nothing to see here.</p>",
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_embeds_token_and_escapes_prompt() {
        let html = entry_form_html(
            "abc123",
            "Discord",
            "Paste your <bot> token",
            "discord.com",
        );
        assert!(html.contains("name=\"token\" value=\"abc123\""));
        assert!(html.contains("&lt;bot&gt;"));
        assert!(html.contains("discord.com"));
        assert!(html.contains("type=\"password\""));
    }

    #[test]
    fn csp_is_strict() {
        let headers = strict_headers();
        let csp = headers
            .get("content-security-policy")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(csp.contains("default-src 'none'"));
        assert!(csp.contains("form-action 'self'"));
        assert!(csp.contains("frame-ancestors 'none'"));
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    }
}
