//! # axum-video-range
//!
//! Range-aware HTTP streaming of large media files for [`axum`][1].
//!
//! The [`Ranged`] responder takes an already-parsed, ordered list of byte
//! ranges (see [`RangeSpec::from_header`]) together with any body
//! implementing the [`RangeBody`] trait, and answers with full-body,
//! single-range (206 + `Content-Range`), or multi-range
//! (`multipart/byteranges`) delivery. Bytes are copied through a bounded
//! transfer buffer, and an optional [`CancelSignal`] stops the copy loop
//! cooperatively when the client goes away.
//!
//! Any type implementing both [`AsyncRead`] and [`AsyncSeekStart`] can be
//! used via the [`KnownSize`] adapter struct. There is also special cased
//! support for [`tokio::fs::File`], see the [`KnownSize::file`] method.
//!
//! [`AsyncSeekStart`] is a trait defined by this crate which only allows
//! seeking from the start of a file. It is automatically implemented for any
//! type implementing [`AsyncSeek`].
//!
//! ```
//! use axum::Router;
//! use axum::routing::get;
//! use axum_extra::{TypedHeader, headers::Range};
//!
//! use axum_video_range::{KnownSize, RangeBody, RangeSpec, Ranged};
//!
//! async fn video(range: Option<TypedHeader<Range>>) -> Ranged<KnownSize<tokio::fs::File>> {
//!     let file = tokio::fs::File::open("video.mp4").await.unwrap();
//!     let body = KnownSize::file(file).await.unwrap();
//!     let total = body.byte_size();
//!     let ranges = range.map(|TypedHeader(range)| RangeSpec::from_header(&range, total));
//!     Ranged::new(ranges, body, "video/mp4")
//! }
//!
//! let _app = Router::<()>::new().route("/video", get(video));
//! ```
//!
//! [1]: https://docs.rs/axum
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncSeek`]: tokio::io::AsyncSeek

mod cancel;
mod file;
mod range;
mod stream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::ContentRange;
use axum_extra::TypedHeader;
use tokio::io::{AsyncRead, AsyncSeek};

pub use cancel::CancelSignal;
pub use file::KnownSize;
pub use range::RangeSpec;
pub use stream::{MultipartStream, RangedStream, TRANSFER_BUF_SIZE};

/// Placeholder multipart boundary used when the caller does not supply one.
///
/// Callers should override it with a token unlikely to occur in the content,
/// see [`Ranged::with_boundary`]. The token is used verbatim, never escaped.
pub const DEFAULT_BOUNDARY: &str = "<1a1s1d1f1g1h1j1k1l1>";

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying resource in bytes.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// Behaviour is not guaranteed if it does change.
    fn byte_size(&self) -> u64;
}

/// The main responder type. Implements [`IntoResponse`].
///
/// The range list is expected to be pre-resolved against the resource length
/// by the transport's Range-header parser; `None` or an empty list selects
/// full-body delivery, one entry a single 206, and two or more a
/// `multipart/byteranges` 206 with parts in the given order.
pub struct Ranged<B: RangeBody + Send + 'static> {
    ranges: Option<Vec<RangeSpec>>,
    body: B,
    content_type: String,
    boundary: String,
    buf_size: usize,
    cancel: CancelSignal,
}

impl<B: RangeBody + Send + 'static> Ranged<B> {
    /// Construct a ranged response over any type implementing [`RangeBody`]
    /// from an ordered list of pre-parsed ranges and a base content type.
    pub fn new(
        ranges: Option<Vec<RangeSpec>>,
        body: B,
        content_type: impl Into<String>,
    ) -> Self {
        Ranged {
            ranges,
            body,
            content_type: content_type.into(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            buf_size: TRANSFER_BUF_SIZE,
            cancel: CancelSignal::new(),
        }
    }

    /// Override the multipart boundary token.
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    /// Override the transfer buffer size, default [`TRANSFER_BUF_SIZE`].
    pub fn with_buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    /// Attach a cancellation signal polled before every buffer iteration.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] if a supplied
    /// range does not lie within the resource.
    pub fn try_respond(self) -> Result<RangedResponse<B>, RangeNotSatisfiable> {
        let Ranged {
            ranges,
            body,
            content_type,
            boundary,
            buf_size,
            cancel,
        } = self;

        let total = body.byte_size();
        let ranges = ranges.unwrap_or_default();

        // ranges arrive pre-resolved by the header parser; anything out of
        // bounds gets a 416 instead of a corrupt 206
        if let Some(bad) = ranges.iter().find(|range| !range.fits_within(total)) {
            tracing::warn!(from = bad.from, to = bad.to, total, "unsatisfiable range");
            return Err(RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total)));
        }

        match ranges.len() {
            0 => {
                let stream = RangedStream::new(body, 0, total, buf_size, cancel);
                Ok(RangedResponse::Full {
                    stream,
                    content_type,
                })
            }
            1 => {
                let range = ranges[0];
                let stream = RangedStream::new(body, range.from, range.len(), buf_size, cancel);
                Ok(RangedResponse::Single {
                    range,
                    total,
                    stream,
                    content_type,
                })
            }
            _ => {
                let stream = MultipartStream::new(
                    body,
                    ranges,
                    total,
                    boundary.clone(),
                    content_type,
                    buf_size,
                    cancel,
                );
                Ok(RangedResponse::Multiple { stream, boundary })
            }
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for Ranged<B> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct RangeNotSatisfiable(pub ContentRange);

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Data type containing computed headers and body for a range response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse<B> {
    /// Full content delivery, no range requested. The response sink keeps its
    /// default status and the transport derives framing from the body length.
    Full {
        stream: RangedStream<B>,
        content_type: String,
    },
    /// 206 with a single `Content-Range` and an explicit `Content-Length`.
    Single {
        range: RangeSpec,
        total: u64,
        stream: RangedStream<B>,
        content_type: String,
    },
    /// 206 `multipart/byteranges`, ranges framed per part.
    Multiple {
        stream: MultipartStream<B>,
        boundary: String,
    },
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedResponse<B> {
    fn into_response(self) -> Response {
        use RangedResponse::*;

        match self {
            Full {
                stream,
                content_type,
            } => {
                let headers = [
                    ("Accept-Ranges", HeaderValue::from_static("bytes")),
                    ("Content-Type", content_type_value(&content_type)),
                ];

                // a full body is not partial content, leave the status alone
                (headers, stream).into_response()
            }
            Single {
                range,
                total,
                stream,
                content_type,
            } => {
                let content_range = format!("bytes {}-{}/{}", range.from, range.to, total);
                let headers = [
                    ("Accept-Ranges", HeaderValue::from_static("bytes")),
                    (
                        "Content-Range",
                        HeaderValue::from_str(&content_range)
                            .expect("Content-Range values are valid ASCII"),
                    ),
                    ("Content-Length", HeaderValue::from(range.len())),
                    ("Content-Type", content_type_value(&content_type)),
                ];

                (StatusCode::PARTIAL_CONTENT, headers, stream).into_response()
            }
            Multiple { stream, boundary } => {
                let content_type = format!("multipart/byteranges; boundary={boundary}");
                let headers = [
                    ("Accept-Ranges", HeaderValue::from_static("bytes")),
                    ("Content-Type", content_type_value(&content_type)),
                ];

                (StatusCode::PARTIAL_CONTENT, headers, stream).into_response()
            }
        }
    }
}

fn content_type_value(content_type: &str) -> HeaderValue {
    HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}
