//! Mock server fixtures and test content

use ripstream_dl::ContentDescriptor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Body served for successful downloads
pub const TRACK_BODY: &[u8] = b"hello";

/// MD5 of [`TRACK_BODY`]
pub const TRACK_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

/// Serve `body` at `/{name}`
pub async fn serve_body(server: &MockServer, name: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Respond to `/{name}` with `status` and an empty body
pub async fn serve_status(server: &MockServer, name: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Descriptor for `/{name}` on `server`, saved as `{name}.flac`
pub fn track(server: &MockServer, name: &str) -> ContentDescriptor {
    ContentDescriptor::new(
        name,
        "qobuz",
        format!("{}/{name}", server.uri()),
        name,
        "flac",
    )
}
