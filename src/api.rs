use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::coaching;
use crate::error::{Result, TelematicsError};
use crate::models::{
    DriverScore, Enrichment, EnrichmentUpdate, Gamification, Premium, TelemetryPoint, TripSummary,
    TripView,
};
use crate::pipeline::{IngestOutcome, ScoringPipeline};

const API_KEY_HEADER: &str = "x-api-key";
const TRIP_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct ApiState {
    pipeline: ScoringPipeline,
    api_key: Arc<str>,
}

impl ApiState {
    pub fn new(pipeline: ScoringPipeline, api_key: &str) -> Self {
        Self {
            pipeline,
            api_key: Arc::from(api_key),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(key) if key == &*self.api_key => Ok(()),
            _ => Err(TelematicsError::Unauthorized),
        }
    }
}

/// Unwraps a JSON body, reporting rejections as validation errors.
fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| TelematicsError::validation(rejection.body_text()))
}

impl IntoResponse for TelematicsError {
    fn into_response(self) -> Response {
        let status = match &self {
            TelematicsError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TelematicsError::NotFound(_) => StatusCode::NOT_FOUND,
            TelematicsError::Unauthorized => StatusCode::UNAUTHORIZED,
            TelematicsError::Storage(err) => {
                tracing::error!(error = ?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            TelematicsError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TelemetryBatch {
    pub driver_id: String,
    pub points: Vec<TelemetryPoint>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    ok: bool,
    #[serde(flatten)]
    outcome: IngestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    hints: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct PremiumResponse {
    #[serde(flatten)]
    premium: Premium,
    gamification: Gamification,
}

#[derive(Debug, Serialize)]
struct TripsResponse {
    trips: Vec<TripView>,
}

#[derive(Debug, Serialize)]
struct HintsResponse {
    hints: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnrichmentResponse {
    ok: bool,
    enrichment: Enrichment,
}

#[derive(Debug, Serialize)]
struct RescoreResponse {
    ok: bool,
    driver_score: f64,
    monthly_premium: f64,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ingest/trip", post(ingest_trip))
        .route("/ingest/telemetry", post(ingest_telemetry))
        .route("/drivers/:driver_id/score", get(driver_score))
        .route("/drivers/:driver_id/premium", get(driver_premium))
        .route("/drivers/:driver_id/trips", get(driver_trips))
        .route("/drivers/:driver_id/coach", get(coach_last_trip))
        .route("/drivers/:driver_id/rescore", post(rescore_driver))
        .route("/enrich/:driver_id", post(set_enrichment))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ingest_trip(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<TripSummary>, JsonRejection>,
) -> Result<Json<IngestResponse>> {
    state.authorize(&headers)?;
    let trip = json_body(payload)?;
    let outcome = state
        .pipeline
        .ingest_trip(trip, None)
        .await?
        .ok_or_else(|| TelematicsError::Storage(anyhow::anyhow!("trip was not recorded")))?;
    Ok(Json(IngestResponse {
        ok: true,
        outcome,
        hints: None,
    }))
}

async fn ingest_telemetry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<TelemetryBatch>, JsonRejection>,
) -> Result<Json<IngestResponse>> {
    state.authorize(&headers)?;
    let batch = json_body(payload)?;
    let (outcome, hints) = state
        .pipeline
        .ingest_telemetry(&batch.driver_id, &batch.points)
        .await?;
    Ok(Json(IngestResponse {
        ok: true,
        outcome,
        hints: Some(hints),
    }))
}

async fn driver_score(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
) -> Result<Json<DriverScore>> {
    state
        .pipeline
        .store()
        .driver_score(&driver_id)
        .await?
        .map(Json)
        .ok_or_else(|| TelematicsError::NotFound("No score yet for driver".to_string()))
}

async fn driver_premium(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
) -> Result<Json<PremiumResponse>> {
    let store = state.pipeline.store();
    let premium = store
        .premium(&driver_id)
        .await?
        .ok_or_else(|| TelematicsError::NotFound("No premium yet for driver".to_string()))?;
    let gamification = store.gamification(&driver_id).await?;
    Ok(Json(PremiumResponse {
        premium,
        gamification,
    }))
}

async fn driver_trips(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
) -> Result<Json<TripsResponse>> {
    let store = state.pipeline.store();
    let trips = store.trips_by_start(&driver_id, TRIP_LIST_LIMIT).await?;

    let mut views = Vec::with_capacity(trips.len());
    for trip in &trips {
        let mut view = trip.to_view();
        view.score = store.trip_score(trip.id).await?.map(|s| s.score);
        views.push(view);
    }
    Ok(Json(TripsResponse { trips: views }))
}

async fn coach_last_trip(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
) -> Result<Json<HintsResponse>> {
    let last = state
        .pipeline
        .store()
        .trips_by_start(&driver_id, 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TelematicsError::NotFound("No trips".to_string()))?;
    Ok(Json(HintsResponse {
        hints: coaching::hints_for_trip(&last.summary),
    }))
}

async fn set_enrichment(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
    headers: HeaderMap,
    payload: std::result::Result<Json<EnrichmentUpdate>, JsonRejection>,
) -> Result<Json<EnrichmentResponse>> {
    state.authorize(&headers)?;
    let update = json_body(payload)?;
    let enrichment = state.pipeline.set_enrichment(&driver_id, &update).await?;
    Ok(Json(EnrichmentResponse {
        ok: true,
        enrichment,
    }))
}

async fn rescore_driver(
    State(state): State<ApiState>,
    Path(driver_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RescoreResponse>> {
    state.authorize(&headers)?;
    let record = state.pipeline.rescore_driver(&driver_id).await?;
    Ok(Json(RescoreResponse {
        ok: true,
        driver_score: record.driver_score.score,
        monthly_premium: record.premium.monthly_premium,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::risk::RuleScorer;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let pipeline = ScoringPipeline::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RuleScorer),
            &Settings::default(),
        );
        router(ApiState::new(pipeline, "devkey"))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn trip_body(driver_id: &str, start: &str, harsh_brakes: u32) -> Value {
        json!({
            "driver_id": driver_id,
            "start_ts": start,
            "end_ts": "2026-02-01T23:59:00",
            "distance_km": 18.0,
            "avg_speed": 48.0,
            "max_speed": 76.0,
            "harsh_brakes": harsh_brakes,
            "night_ratio": 0.1,
            "speeding_events": 1,
            "centroid_lat": 33.4255,
            "centroid_lon": -111.94
        })
    }

    #[tokio::test]
    async fn health_is_open() {
        let (status, json) = call(&app(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn ingest_requires_api_key() {
        let app = app();
        let body = trip_body("D001", "2026-02-01T08:00:00", 0);
        let (missing, json) = call(&app, post_json("/ingest/trip", None, body.clone())).await;
        assert_eq!(missing, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "unauthorized");

        let (wrong, _) = call(&app, post_json("/ingest/trip", Some("nope"), body)).await;
        assert_eq!(wrong, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, get("/drivers/D001/score")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingested_trip_is_visible_through_read_endpoints() {
        let app = app();
        let (status, ingest) = call(
            &app,
            post_json(
                "/ingest/trip",
                Some("devkey"),
                trip_body("D001", "2026-02-01T08:00:00", 2),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ingest["ok"], true);
        assert!(ingest.get("hints").is_none());

        let (status, score) = call(&app, get("/drivers/D001/score")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(score["driver_id"], "D001");
        assert_eq!(score["score"], ingest["driver_score"]);
        let trips = score["breakdown"]["trips"].as_array().unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0]["breakdown"]["model"], "rules");
        assert!(trips[0]["breakdown"]["norms"]["harsh_per_100km"].as_f64().unwrap() > 11.0);

        let (status, premium) = call(&app, get("/drivers/D001/premium")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(premium["monthly_premium"], ingest["monthly_premium"]);
        assert_eq!(premium["breakdown"]["base_rate"], 120.0);
        assert_eq!(premium["gamification"]["safe_streak_days"], 1);
        assert_eq!(premium["gamification"]["points"], 5);

        let (status, trips) = call(&app, get("/drivers/D001/trips")).await;
        assert_eq!(status, StatusCode::OK);
        let trips = trips["trips"].as_array().unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0]["centroid"], json!([33.4255, -111.94]));
        assert_eq!(trips[0]["id"], ingest["trip_id"]);
        assert_eq!(trips[0]["score"], ingest["trip_score"]);
    }

    #[tokio::test]
    async fn trips_are_listed_latest_start_first() {
        let app = app();
        for start in ["2026-02-01T08:00:00Z", "2026-02-01T18:00:00Z", "2026-02-01T12:00:00Z"] {
            let (status, _) = call(
                &app,
                post_json("/ingest/trip", Some("devkey"), trip_body("D002", start, 0)),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (_, json) = call(&app, get("/drivers/D002/trips")).await;
        let starts: Vec<&str> = json["trips"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["start_ts"].as_str().unwrap())
            .collect();
        assert_eq!(
            starts,
            vec![
                "2026-02-01T18:00:00+00:00",
                "2026-02-01T12:00:00+00:00",
                "2026-02-01T08:00:00+00:00"
            ]
        );
    }

    #[tokio::test]
    async fn invalid_trip_is_unprocessable() {
        let mut body = trip_body("D003", "2026-02-01T08:00:00", 0);
        body["distance_km"] = json!(-4.0);
        let (status, json) = call(&app(), post_json("/ingest/trip", Some("devkey"), body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("distance_km"));
    }

    fn post_raw(uri: &str, key: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, key)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn undecodable_bodies_are_json_validation_errors() {
        let app = app();

        let (status, json) = call(
            &app,
            post_raw("/ingest/telemetry", "devkey", r#"{"driver_id": "D009", "points": ["#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().starts_with("invalid input"));

        let (status, json) = call(
            &app,
            post_json("/ingest/telemetry", Some("devkey"), json!({ "driver_id": "D009" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("points"));

        let mut negative = trip_body("D009", "2026-02-01T08:00:00", 0);
        negative["harsh_brakes"] = json!(-1);
        let (status, json) = call(&app, post_json("/ingest/trip", Some("devkey"), negative)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("harsh_brakes"));

        let (status, json) = call(
            &app,
            post_raw("/enrich/D009", "devkey", r#"{"vehicle_risk": "high"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].is_string());

        // The key is checked before the body.
        let (status, json) = call(&app, post_raw("/ingest/trip", "wrong", "not json")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "unauthorized");
    }

    #[tokio::test]
    async fn telemetry_ingest_returns_hints_and_enforces_minimum_points() {
        let app = app();
        let points: Vec<Value> = (0..8)
            .map(|i| {
                json!({
                    "ts": format!("2026-02-01T23:{:02}:00", i),
                    "speed_kph": 82.0,
                    "accel_mps2": if i % 2 == 0 { -5.0 } else { 0.3 },
                    "lat": 33.4255,
                    "lon": -111.94
                })
            })
            .collect();
        let (status, json) = call(
            &app,
            post_json(
                "/ingest/telemetry",
                Some("devkey"),
                json!({ "driver_id": "D004", "points": points }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let hints: Vec<&str> = json["hints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h.as_str().unwrap())
            .collect();
        assert_eq!(
            hints,
            vec![coaching::SPEEDING_HINT, coaching::BRAKING_HINT, coaching::NIGHT_HINT]
        );

        let (status, trips) = call(&app, get("/drivers/D004/trips")).await;
        assert_eq!(status, StatusCode::OK);
        let trip = &trips["trips"][0];
        assert_eq!(trip["harsh_brakes"], 4);
        assert_eq!(trip["speeding_events"], 8);
        assert_eq!(trip["night_ratio"], 1.0);

        let single = json!({ "driver_id": "D004", "points": [points[0].clone()] });
        let (status, _) = call(&app, post_json("/ingest/telemetry", Some("devkey"), single)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn coach_uses_latest_trip() {
        let app = app();
        let (status, _) = call(&app, get("/drivers/D005/coach")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut body = trip_body("D005", "2026-02-01T08:00:00", 6);
        body["night_ratio"] = json!(0.8);
        call(&app, post_json("/ingest/trip", Some("devkey"), body)).await;

        let (status, json) = call(&app, get("/drivers/D005/coach")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["hints"],
            json!([coaching::BRAKING_HINT, coaching::NIGHT_HINT])
        );
    }

    #[tokio::test]
    async fn enrichment_then_rescore_raises_score() {
        let app = app();
        let (_, ingest) = call(
            &app,
            post_json(
                "/ingest/trip",
                Some("devkey"),
                trip_body("D006", "2026-02-01T08:00:00", 0),
            ),
        )
        .await;
        let base = ingest["driver_score"].as_f64().unwrap();

        let (status, _) = call(
            &app,
            post_json("/enrich/D006", None, json!({ "vehicle_risk": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, json) = call(
            &app,
            post_json(
                "/enrich/D006",
                Some("devkey"),
                json!({ "vehicle_risk": 1.0, "weather_risk": null }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["enrichment"]["vehicle_risk"], 1.0);
        assert_eq!(json["enrichment"]["weather_risk"], 0.0);

        let (status, json) = call(
            &app,
            post_json("/drivers/D006/rescore", Some("devkey"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rescored = json["driver_score"].as_f64().unwrap();
        assert!((rescored - (base + 5.0)).abs() < 0.011);

        let (_, score) = call(&app, get("/drivers/D006/score")).await;
        assert_eq!(score["breakdown"]["enrichment_offsets"]["vehicle_risk"], 5.0);
    }

    #[tokio::test]
    async fn enrichment_creates_unknown_driver() {
        let app = app();
        let (status, _) = call(
            &app,
            post_json("/enrich/NEW1", Some("devkey"), json!({ "local_crash_rate": 0.4 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, post_json("/drivers/NEW1/rescore", Some("devkey"), json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
