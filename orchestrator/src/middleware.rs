/// Browser dashboards poll the task and metrics endpoints cross-origin.
pub fn cors() -> warp::cors::Builder {
    warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "Origin",
            "Accept",
            "Content-Type",
            "Content-Length",
            "Authorization",
            "Access-Control-Request-Method",
            "Access-Control-Request-Headers",
        ])
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
}
