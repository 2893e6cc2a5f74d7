use async_trait::async_trait;
use futures::{stream, StreamExt};
use moka::future::Cache;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use yup_oauth2::{ServiceAccountAuthenticator, ServiceAccountKey};

use crate::{
    credentials::ServiceAccount,
    error::DispatchError,
    gateway::{GatewayFactory, MulticastMessage, MulticastOutcome, PlatformHints, PushGateway},
    metrics,
    models::Platform,
};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const MAX_RETRIES: u8 = 3;

// FCM HTTP v1 request body
#[derive(Debug, Serialize)]
struct FcmRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Debug, Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    android: Option<AndroidConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apns: Option<ApnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webpush: Option<WebpushConfig>,
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct AndroidConfig {
    priority: &'static str,
    notification: AndroidNotification,
}

#[derive(Debug, Serialize)]
struct AndroidNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'static str>,
    default_vibrate_timings: bool,
}

#[derive(Debug, Serialize)]
struct ApnsConfig {
    headers: ApnsHeaders,
    payload: ApnsPayload,
}

#[derive(Debug, Serialize)]
struct ApnsHeaders {
    #[serde(rename = "apns-priority")]
    apns_priority: &'static str,
}

#[derive(Debug, Serialize)]
struct ApnsPayload {
    aps: Aps,
}

#[derive(Debug, Serialize)]
struct Aps {
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WebpushConfig {
    headers: WebpushHeaders,
}

#[derive(Debug, Serialize)]
struct WebpushHeaders {
    #[serde(rename = "Urgency")]
    urgency: &'static str,
}

fn build_request<'a>(token: &'a str, message: &'a MulticastMessage) -> FcmRequest<'a> {
    let hints: &PlatformHints = &message.hints;
    let priority = if hints.high_priority { "high" } else { "normal" };
    let sound = hints.default_sound.then_some("default");

    let (android, apns, webpush) = match hints.platform {
        Platform::Android => (
            Some(AndroidConfig {
                priority,
                notification: AndroidNotification {
                    sound,
                    default_vibrate_timings: hints.default_vibration,
                },
            }),
            None,
            None,
        ),
        Platform::Ios => (
            None,
            Some(ApnsConfig {
                headers: ApnsHeaders {
                    apns_priority: if hints.high_priority { "10" } else { "5" },
                },
                payload: ApnsPayload {
                    aps: Aps {
                        sound,
                        badge: hints.badge,
                    },
                },
            }),
            None,
        ),
        Platform::Web => (
            None,
            None,
            Some(WebpushConfig {
                headers: WebpushHeaders { urgency: priority },
            }),
        ),
    };

    FcmRequest {
        message: FcmMessage {
            token,
            notification: FcmNotification {
                title: &message.title,
                body: &message.body,
            },
            android,
            apns,
            webpush,
        },
    }
}

/// Builds FCM handles from uploaded service account blobs.
pub struct FcmGatewayFactory {
    http: Client,
    api_url: String,
    concurrency: usize,
}

impl FcmGatewayFactory {
    pub fn new(api_url: impl Into<String>, concurrency: usize) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            concurrency: concurrency.max(1),
        })
    }
}

fn parse_key(tenant_id: &str, blob: &[u8]) -> Result<(ServiceAccount, ServiceAccountKey), DispatchError> {
    let malformed = |reason: String| DispatchError::CredentialMalformed {
        tenant_id: tenant_id.to_string(),
        reason,
    };

    let account = ServiceAccount::parse(blob).map_err(malformed)?;

    // token_uri is optional in uploaded files but required by the OAuth flow.
    let mut value: serde_json::Value =
        serde_json::from_slice(blob).map_err(|e| malformed(e.to_string()))?;
    if value.get("token_uri").is_none() {
        value["token_uri"] = serde_json::Value::String(DEFAULT_TOKEN_URI.to_string());
    }
    let key = yup_oauth2::parse_service_account_key(value.to_string())
        .map_err(|e| malformed(e.to_string()))?;

    Ok((account, key))
}

#[async_trait]
impl GatewayFactory for FcmGatewayFactory {
    async fn build(
        &self,
        tenant_id: &str,
        blob: &[u8],
    ) -> Result<Arc<dyn PushGateway>, DispatchError> {
        let (account, key) = parse_key(tenant_id, blob)?;

        info!(
            tenant_id = %tenant_id,
            project_id = %account.project_id,
            "Created FCM gateway"
        );

        Ok(Arc::new(FcmGateway {
            tenant_id: tenant_id.to_string(),
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                self.api_url, account.project_id
            ),
            key,
            http: self.http.clone(),
            concurrency: self.concurrency,
            access_tokens: Cache::builder()
                .max_capacity(1)
                .time_to_live(Duration::from_secs(50 * 60))
                .build(),
        }))
    }
}

pub struct FcmGateway {
    tenant_id: String,
    send_url: String,
    key: ServiceAccountKey,
    http: Client,
    concurrency: usize,
    access_tokens: Cache<&'static str, String>,
}

enum SendError {
    Retryable(String),
    Permanent(String),
}

impl FcmGateway {
    async fn access_token(&self) -> Result<String, DispatchError> {
        let key = self.key.clone();
        self.access_tokens
            .try_get_with(FCM_SCOPE, async move {
                let auth = ServiceAccountAuthenticator::builder(key)
                    .build()
                    .await
                    .map_err(|e| e.to_string())?;
                let token = auth.token(&[FCM_SCOPE]).await.map_err(|e| e.to_string())?;
                token
                    .token()
                    .map(str::to_string)
                    .ok_or_else(|| "No token available".to_string())
            })
            .await
            .map_err(|e| DispatchError::Gateway {
                tenant_id: self.tenant_id.clone(),
                message: format!("authentication failed: {}", e),
            })
    }

    async fn send_once(&self, bearer: &str, token: &str, message: &MulticastMessage) -> Result<(), SendError> {
        let response = self
            .http
            .post(&self.send_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
            .json(&build_request(token, message))
            .send()
            .await
            .map_err(|e| SendError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(SendError::Retryable(format!("{}: {}", status, body)))
        } else {
            Err(SendError::Permanent(format!("{}: {}", status, body)))
        }
    }

    async fn send_with_retry(&self, bearer: &str, token: &str, message: &MulticastMessage) -> bool {
        let mut attempt = 0;
        let mut backoff_ms = 100;

        loop {
            attempt += 1;
            match self.send_once(bearer, token, message).await {
                Ok(()) => return true,
                Err(SendError::Permanent(e)) => {
                    debug!(
                        tenant_id = %self.tenant_id,
                        error = %e,
                        "FCM rejected token"
                    );
                    return false;
                }
                Err(SendError::Retryable(e)) => {
                    if attempt >= MAX_RETRIES {
                        error!(
                            tenant_id = %self.tenant_id,
                            error = %e,
                            "Failed to send push after maximum retries"
                        );
                        return false;
                    }
                    warn!(
                        tenant_id = %self.tenant_id,
                        error = %e,
                        attempt,
                        "Failed to send push, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> Result<MulticastOutcome, DispatchError> {
        let bearer = self.access_token().await?;
        let timer = std::time::Instant::now();

        let results: Vec<bool> = stream::iter(message.tokens.clone())
            .map(|token| {
                let bearer = bearer.clone();
                async move { self.send_with_retry(&bearer, &token, message).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let success_count = results.iter().filter(|ok| **ok).count();
        let outcome = MulticastOutcome {
            success_count,
            failure_count: results.len() - success_count,
        };

        metrics::GATEWAY_SEND_TIME.observe(timer.elapsed().as_secs_f64());
        info!(
            tenant_id = %self.tenant_id,
            success = outcome.success_count,
            failure = outcome.failure_count,
            "FCM multicast finished"
        );

        Ok(outcome)
    }

    async fn release(&self) {
        self.access_tokens.invalidate_all();
        debug!(tenant_id = %self.tenant_id, "Released FCM gateway");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::service_account_json;

    fn message(platform: Platform) -> MulticastMessage {
        MulticastMessage {
            title: "Sale".into(),
            body: "50% off".into(),
            tokens: vec!["tok-1".into()],
            hints: PlatformHints::for_platform(platform),
        }
    }

    #[test]
    fn android_request_carries_priority_sound_and_vibration() {
        let msg = message(Platform::Android);
        let value = serde_json::to_value(build_request("tok-1", &msg)).unwrap();
        let m = &value["message"];

        assert_eq!(m["token"], "tok-1");
        assert_eq!(m["notification"]["title"], "Sale");
        assert_eq!(m["notification"]["body"], "50% off");
        assert_eq!(m["android"]["priority"], "high");
        assert_eq!(m["android"]["notification"]["sound"], "default");
        assert_eq!(m["android"]["notification"]["default_vibrate_timings"], true);
        assert!(m.get("apns").is_none());
        assert!(m.get("webpush").is_none());
    }

    #[test]
    fn ios_request_carries_apns_priority_and_badge() {
        let msg = message(Platform::Ios);
        let value = serde_json::to_value(build_request("tok-1", &msg)).unwrap();
        let apns = &value["message"]["apns"];

        assert_eq!(apns["headers"]["apns-priority"], "10");
        assert_eq!(apns["payload"]["aps"]["sound"], "default");
        assert_eq!(apns["payload"]["aps"]["badge"], 1);
        assert!(value["message"].get("android").is_none());
    }

    #[test]
    fn web_request_is_urgent() {
        let msg = message(Platform::Web);
        let value = serde_json::to_value(build_request("tok-1", &msg)).unwrap();
        assert_eq!(value["message"]["webpush"]["headers"]["Urgency"], "high");
    }

    #[tokio::test]
    async fn malformed_blob_fails_fast() {
        let factory = FcmGatewayFactory::new("https://fcm.example.test", 4).unwrap();

        let err = factory.build("client-x", b"{not json").await.err().unwrap();
        assert!(matches!(err, DispatchError::CredentialMalformed { ref tenant_id, .. } if tenant_id == "client-x"));
        assert!(err.is_fatal());

        let err = factory
            .build("client-x", br#"{"type":"service_account"}"#)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::CredentialMalformed { .. }));
    }

    #[tokio::test]
    async fn well_formed_blob_builds_a_gateway() {
        let factory = FcmGatewayFactory::new("https://fcm.example.test/", 4).unwrap();
        let blob = service_account_json("demo-project");
        assert!(factory.build("client-ok", blob.as_bytes()).await.is_ok());
    }

    #[derive(Clone, Default)]
    struct FakeFcm {
        requests: Arc<std::sync::Mutex<Vec<String>>>,
    }

    async fn fake_fcm(
        axum::extract::State(fcm): axum::extract::State<FakeFcm>,
        headers: axum::http::HeaderMap,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> axum::http::StatusCode {
        let token = body["message"]["token"].as_str().unwrap_or_default().to_string();
        fcm.requests.lock().unwrap().push(token.clone());

        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer cached-token") {
            return axum::http::StatusCode::UNAUTHORIZED;
        }
        if token.starts_with("stale") {
            axum::http::StatusCode::NOT_FOUND
        } else {
            axum::http::StatusCode::OK
        }
    }

    async fn serve_fake_fcm() -> (String, FakeFcm) {
        let fcm = FakeFcm::default();
        let app = axum::Router::new().fallback(fake_fcm).with_state(fcm.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), fcm)
    }

    #[tokio::test]
    async fn send_multicast_counts_per_token_outcomes() {
        let (url, fcm) = serve_fake_fcm().await;
        let blob = service_account_json("demo-project");
        let (_, key) = parse_key("client-ok", blob.as_bytes()).unwrap();
        let gateway = FcmGateway {
            tenant_id: "client-ok".into(),
            send_url: format!("{}/v1/projects/demo-project/messages:send", url),
            key,
            http: Client::new(),
            concurrency: 2,
            access_tokens: Cache::builder().max_capacity(1).build(),
        };
        gateway
            .access_tokens
            .insert(FCM_SCOPE, "cached-token".to_string())
            .await;

        let mut msg = message(Platform::Android);
        msg.tokens = vec!["tok-1".into(), "stale-2".into(), "tok-3".into(), "tok-4".into()];

        let outcome = gateway.send_multicast(&msg).await.unwrap();
        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failure_count, 1);

        // Permanent rejections are not retried.
        let mut seen = fcm.requests.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["stale-2", "tok-1", "tok-3", "tok-4"]);
    }
}
