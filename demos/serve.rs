use std::path::PathBuf;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_extra::headers::Range;
use axum_extra::TypedHeader;
use serde::Deserialize;

use axum_video_range::{KnownSize, RangeBody, RangeSpec, Ranged};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/file", get(get_file));

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, router).await.unwrap();
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
}

async fn get_file(
    range_header: Option<TypedHeader<Range>>,
    Query(q): Query<FileRequest>,
) -> impl IntoResponse {
    let path = PathBuf::from(&q.path);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            return (StatusCode::NOT_FOUND, format!("File not found: {e}")).into_response();
        }
    };

    let body = match KnownSize::file(file).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response();
        }
    };

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let total = body.byte_size();
    let ranges = range_header.map(|TypedHeader(range)| RangeSpec::from_header(&range, total));

    Ranged::new(ranges, body, content_type).into_response()
}
