//! Non-blocking outbound HTTP/1.x: one state machine per request, all driven by an engine
//! that the main loop ticks.

mod chunked;
pub mod client;
pub mod engine;
pub mod error;
pub mod request;
pub mod url;

pub use chunked::ChunkedDecoder;
pub use client::{HttpClient, HttpResponse, Phase};
pub use engine::{ClientHandle, Completed, CompletionCallback, HttpClientEngine};
pub use error::{describe_result, HttpClientError};
pub use request::{HttpRequest, Method};
pub use self::url::{HttpTarget, UrlError};
