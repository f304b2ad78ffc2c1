// Request logging, compression and CORS

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::middleware::{Compress, Logger};

pub fn setup_middleware() -> (Logger, Compress) {
    let logger = Logger::new("%a \"%r\" %s %b %Dms").exclude("/health");
    let compress = Compress::default();
    (logger, compress)
}

/// Read-only API: GET from the listed origins, or from anywhere for `*`.
pub fn setup_cors(allowed_origins: &str) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET"])
        .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
        .max_age(3600);

    for origin in allowed_origins.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        if origin == "*" {
            return cors.allow_any_origin();
        }
        cors = cors.allowed_origin(origin);
    }

    cors
}
