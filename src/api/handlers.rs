// HTTP request handlers for API endpoints

use std::time::Instant;

use actix_web::{web, HttpResponse, Result};
use serde::Serialize;

use crate::api::models::*;
use crate::database_ops::QueryEngine;

/// Shared state behind every handler.
pub struct AppState {
    pub engine: QueryEngine,
    pub store_kind: &'static str,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: QueryEngine, store_kind: &'static str) -> Self {
        Self {
            engine,
            store_kind,
            started: Instant::now(),
        }
    }
}

fn ok<T: Serialize>(data: T) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ApiResponse::success(data)))
}

fn bad_request(message: String) -> Result<HttpResponse> {
    Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(message)))
}

fn not_found(what: &str, id: i64) -> Result<HttpResponse> {
    Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error(format!("{what} {id} not found"))))
}

fn internal(route: &str, e: anyhow::Error) -> Result<HttpResponse> {
    tracing::error!(route, error = ?e, "query failed");
    Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error("internal error")))
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    // Reading the newest score doubles as a store connectivity check.
    let (status, latest) = match state.engine.latest_score_time().await {
        Ok(latest) => ("healthy", latest),
        Err(e) => {
            tracing::warn!(error = ?e, "health check could not reach the store");
            ("degraded", None)
        }
    };
    ok(HealthResponse {
        status: status.to_string(),
        store: state.store_kind.to_string(),
        latest_score_at: latest,
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

/// Ranked, filtered score listing
pub async fn get_scores(
    state: web::Data<AppState>,
    params: web::Query<ScoresParams>,
) -> Result<HttpResponse> {
    let query = match params.into_inner().into_query() {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.scores(&query).await {
        Ok(scores) => ok(scores),
        Err(e) => internal("scores", e),
    }
}

pub async fn get_recent_scores(state: web::Data<AppState>) -> Result<HttpResponse> {
    match state.engine.recent_scores().await {
        Ok(scores) => ok(scores),
        Err(e) => internal("recent_scores", e),
    }
}

pub async fn get_beatmap(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let id = path.into_inner();
    match state.engine.beatmap(id).await {
        Ok(Some(beatmap)) => ok(beatmap),
        Ok(None) => not_found("beatmap", id),
        Err(e) => internal("beatmap", e),
    }
}

pub async fn get_beatmaps(
    state: web::Data<AppState>,
    params: web::Query<IdsParams>,
) -> Result<HttpResponse> {
    let ids = match params.parse() {
        Ok(ids) => ids,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.beatmaps(&ids).await {
        Ok(beatmaps) => ok(beatmaps),
        Err(e) => internal("beatmaps", e),
    }
}

pub async fn get_beatmapsets(
    state: web::Data<AppState>,
    params: web::Query<IdsParams>,
) -> Result<HttpResponse> {
    let ids = match params.parse() {
        Ok(ids) => ids,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.beatmapsets(&ids).await {
        Ok(sets) => ok(sets),
        Err(e) => internal("beatmapsets", e),
    }
}

pub async fn get_user(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let id = path.into_inner();
    match state.engine.user(id).await {
        Ok(Some(user)) => ok(user),
        Ok(None) => not_found("user", id),
        Err(e) => internal("user", e),
    }
}

pub async fn get_users(
    state: web::Data<AppState>,
    params: web::Query<IdsParams>,
) -> Result<HttpResponse> {
    let ids = match params.parse() {
        Ok(ids) => ids,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.users(&ids).await {
        Ok(users) => ok(users),
        Err(e) => internal("users", e),
    }
}

pub async fn get_user_scores(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    params: web::Query<UserScoresParams>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let query = match params.into_inner().into_query() {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.user_scores(user_id, &query).await {
        Ok(scores) => ok(scores),
        Err(e) => internal("user_scores", e),
    }
}

pub async fn get_user_score_count(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    params: web::Query<ModeParams>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let mode = match params.mode() {
        Ok(mode) => mode,
        Err(msg) => return bad_request(msg),
    };
    match state.engine.user_score_count(user_id, mode).await {
        Ok(count) => ok(ScoreCountResponse { user_id, mode, count }),
        Err(e) => internal("user_score_count", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::configure_routes;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::database_ops::models::fixtures::{beatmap, score, user};
    use crate::database_ops::EntityUpsertStore;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::sync::Arc;

    async fn state() -> web::Data<AppState> {
        let store = EntityUpsertStore::new(Arc::new(MemoryStore::new()));
        let mut scores = vec![score(1, 10, 100, 900), score(2, 10, 200, 1_000)];
        for s in &mut scores {
            s.beatmap = Some(Arc::new(beatmap(s.beatmap_id, 5)));
            s.user = Some(Arc::new(user(s.user_id, if s.user_id == 100 { "PL" } else { "DE" })));
        }
        store.create_many(&mut scores).await.unwrap();
        web::Data::new(AppState::new(QueryEngine::new(store), "memory"))
    }

    async fn get_json(uri: &str) -> (u16, Value) {
        let app = test::init_service(App::new().app_data(state().await).configure(configure_routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        let status = resp.status().as_u16();
        (status, test::read_body_json(resp).await)
    }

    #[actix_web::test]
    async fn health_reports_store_and_latest_score() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["store"], "memory");
        assert!(body["data"]["latest_score_at"].is_string());
    }

    #[actix_web::test]
    async fn scores_are_ranked_and_filterable() {
        let (status, body) = get_json("/api/v1/scores?sort=total_score").await;
        assert_eq!(status, 200);
        let scores = body["data"].as_array().unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0]["id"], 2);
        assert_eq!(scores[0]["map_rank"], 1);
        assert_eq!(scores[1]["map_rank"], 2);

        let (_, body) = get_json("/api/v1/scores?country=PL").await;
        let scores = body["data"].as_array().unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0]["map_rank"], 2);
    }

    #[actix_web::test]
    async fn invalid_parameters_are_rejected() {
        let (status, body) = get_json("/api/v1/scores?mode=piano").await;
        assert_eq!(status, 400);
        assert_eq!(body["success"], false);
        let (status, _) = get_json("/api/v1/users?ids=1,abc").await;
        assert_eq!(status, 400);
    }

    #[actix_web::test]
    async fn lookups_return_404_for_unknown_ids() {
        let (status, body) = get_json("/api/v1/users/100").await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["country"]["code"], "PL");
        let (status, _) = get_json("/api/v1/users/999").await;
        assert_eq!(status, 404);
        let (status, _) = get_json("/api/v1/beatmaps/404").await;
        assert_eq!(status, 404);
        let (_, body) = get_json("/api/v1/beatmapsets?ids=5,6").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn user_scores_and_count() {
        let (_, body) = get_json("/api/v1/users/200/scores?mode=osu").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        let (_, body) = get_json("/api/v1/users/200/scores/count").await;
        assert_eq!(body["data"]["count"], 1);
        let (_, body) = get_json("/api/v1/users/200/scores/count?mode=mania").await;
        assert_eq!(body["data"]["count"], 0);
    }
}
