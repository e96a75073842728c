use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use mirror_common::auth::secret_matches;
use mirror_common::event::{AccountChangeEvent, AccountPayload};
use mirror_common::metrics_consts::{EVENTS_RECEIVED, UNAUTHORIZED_MESSAGES};
use mirror_common::pipeline::ProcessOutcome;
use mirror_common::transactions::TransactionPayload;
use serde_derive::Serialize;
use tracing::{debug, warn};

use super::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct WebhookResponse {
    written: usize,
    deleted: usize,
    ignored: usize,
}

impl WebhookResponse {
    fn from_outcomes(outcomes: &[ProcessOutcome]) -> Self {
        let mut response = Self::default();
        for outcome in outcomes {
            match outcome {
                ProcessOutcome::Written(_) => response.written += 1,
                ProcessOutcome::Deleted { .. } => response.deleted += 1,
                ProcessOutcome::DecodeMiss | ProcessOutcome::Irrelevant => response.ignored += 1,
            }
        }
        response
    }
}

/// Rejects the request before anything is read or written.
fn admit(state: &AppState, headers: &HeaderMap, source: &'static str) -> Result<(), ApiError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !secret_matches(&state.webhook_secret, presented) {
        warn!(source, "rejecting webhook with a bad authorization header");
        metrics::counter!(UNAUTHORIZED_MESSAGES, "source" => source).increment(1);
        return Err(ApiError::Unauthorized);
    }
    if state.refresh.is_running() {
        return Err(ApiError::RefreshRunning);
    }
    Ok(())
}

pub async fn accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    admit(&state, &headers, "account-webhook")?;

    let payloads: Vec<AccountPayload> = serde_json::from_slice(&body)?;
    let events = payloads
        .into_iter()
        .map(AccountChangeEvent::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    metrics::counter!(EVENTS_RECEIVED, "source" => "account-webhook")
        .increment(events.len() as u64);
    debug!(accounts = events.len(), "received account webhook");

    let outcomes = state.processor.process_batch(&events).await?;
    Ok(Json(WebhookResponse::from_outcomes(&outcomes)))
}

pub async fn transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    admit(&state, &headers, "transaction-webhook")?;

    let payloads: Vec<TransactionPayload> = serde_json::from_slice(&body)?;
    metrics::counter!(EVENTS_RECEIVED, "source" => "transaction-webhook")
        .increment(payloads.len() as u64);

    let mut events = Vec::new();
    for payload in &payloads {
        events.extend(
            state
                .resolver
                .resolve(payload.account_keys(), payload.slot)
                .await?,
        );
    }
    debug!(
        transactions = payloads.len(),
        accounts = events.len(),
        "resolved transaction webhook"
    );

    let outcomes = state.processor.process_batch(&events).await?;
    Ok(Json(WebhookResponse::from_outcomes(&outcomes)))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use http_body_util::BodyExt; // for `collect`
    use httpmock::MockServer;
    use serde_json::json;
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use super::*;
    use crate::fixtures::{counter_base64, migrated_registry, rpc_account, stored_count, PROGRAM};
    use crate::handlers::app::app;
    use crate::handlers::app::tests::{state, SECRET};

    fn post(uri: &str, secret: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut request = Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = secret {
            request = request.header(http::header::AUTHORIZATION, secret);
        }
        request.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn writes_accounts(db: PgPool) {
        let registry = migrated_registry(&db).await;
        let app = app(state(db.clone(), registry, "http://localhost:8899"), None);

        let response = app
            .oneshot(post(
                "/account-webhook",
                Some(SECRET),
                json!([
                    {"pubkey": "counter-1", "program": PROGRAM, "data": counter_base64(3)},
                    {"pubkey": "other", "program": "SomeoneElse", "data": "AQID"}
                ]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"written": 1, "deleted": 0, "ignored": 1})
        );
        assert_eq!(stored_count(&db, "counter-1").await.as_deref(), Some("3"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn wrong_secret_is_rejected_without_writing(db: PgPool) {
        let registry = migrated_registry(&db).await;
        let app = app(state(db.clone(), registry, "http://localhost:8899"), None);
        let body = json!([{"pubkey": "counter-1", "program": PROGRAM, "data": counter_base64(3)}]);

        let response = app
            .clone()
            .oneshot(post("/account-webhook", Some("not-the-secret"), body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post("/account-webhook", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(stored_count(&db, "counter-1").await, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn unavailable_during_refresh(db: PgPool) {
        let registry = migrated_registry(&db).await;
        let state = state(db.clone(), registry, "http://localhost:8899");
        let permit = state.refresh.try_start().unwrap();
        let app = app(state, None);

        let response = app
            .clone()
            .oneshot(post(
                "/account-webhook",
                Some(SECRET),
                json!([{"pubkey": "counter-1", "program": PROGRAM, "data": counter_base64(3)}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        drop(permit);
        let response = app
            .oneshot(post(
                "/account-webhook",
                Some(SECRET),
                json!([{"pubkey": "counter-1", "program": PROGRAM, "data": counter_base64(3)}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn bad_payloads_are_client_errors(db: PgPool) {
        let registry = migrated_registry(&db).await;
        let app = app(state(db, registry, "http://localhost:8899"), None);

        let response = app
            .clone()
            .oneshot(post("/account-webhook", Some(SECRET), json!({"not": "a list"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post(
                "/account-webhook",
                Some(SECRET),
                json!([{"pubkey": "a", "program": PROGRAM, "data": "%%%"}]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn resolves_transactions_through_the_chain(db: PgPool) {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .json_body_partial(r#"{"method": "getMultipleAccounts"}"#);
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {"context": {"slot": 90}, "value": [rpc_account(11), null]}
                }));
            })
            .await;

        let registry = migrated_registry(&db).await;
        sqlx::query("INSERT INTO public.counters (address, count) VALUES ('closed', 2)")
            .execute(&db)
            .await
            .unwrap();
        let app = app(state(db.clone(), registry, &server.base_url()), None);

        let response = app
            .oneshot(post(
                "/transaction-webhook",
                Some(SECRET),
                json!([{
                    "slot": 90,
                    "transaction": {"message": {"accountKeys": [
                        {"pubkey": "touched", "signer": true, "writable": true},
                        "closed"
                    ]}}
                }]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        lookup.assert_async().await;
        assert_eq!(
            body_json(response).await,
            json!({"written": 1, "deleted": 1, "ignored": 0})
        );
        assert_eq!(stored_count(&db, "touched").await.as_deref(), Some("11"));
        assert_eq!(stored_count(&db, "closed").await, None);
    }
}
