// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                // Scores
                .route("/scores", web::get().to(handlers::get_scores))
                .route("/scores/recent", web::get().to(handlers::get_recent_scores))
                // Beatmaps
                .route("/beatmaps", web::get().to(handlers::get_beatmaps))
                .route("/beatmaps/{id}", web::get().to(handlers::get_beatmap))
                .route("/beatmapsets", web::get().to(handlers::get_beatmapsets))
                // Users
                .route("/users", web::get().to(handlers::get_users))
                .route("/users/{id}", web::get().to(handlers::get_user))
                .route("/users/{id}/scores", web::get().to(handlers::get_user_scores))
                .route(
                    "/users/{id}/scores/count",
                    web::get().to(handlers::get_user_score_count),
                ),
        );
}
