//! Transport and post-processing seams of the pipeline

use crate::descriptor::ContentDescriptor;
use crate::error::Result;
use crate::session::{SessionManager, SessionResponse};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// An open response body
#[async_trait]
pub trait ByteStream: Send {
    /// Whether the body starts at the requested offset
    ///
    /// False means the server ignored the range and the body starts at byte zero.
    fn resumed(&self) -> bool;

    /// Full length of the resource, when the server reports it
    fn total_size(&self) -> Option<u64>;

    /// Next chunk of the body, or None at the end
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Opens the body of a descriptor
///
/// The pipeline talks to the network only through this trait; [`HttpFetcher`] is
/// the production implementation.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Open the body of `descriptor` starting at byte `offset`
    async fn open(&self, descriptor: &ContentDescriptor, offset: u64)
    -> Result<Box<dyn ByteStream>>;
}

/// Hook invoked once per successful download (tag embedding and the like)
///
/// Errors and panics are logged and never fail the download.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Process the finished file at `path`
    async fn process(&self, descriptor: &ContentDescriptor, path: &Path) -> Result<()>;
}

/// [`ContentFetcher`] backed by the pooled session layer
pub struct HttpFetcher {
    sessions: Arc<SessionManager>,
}

impl HttpFetcher {
    /// Fetch through `sessions`
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn open(
        &self,
        descriptor: &ContentDescriptor,
        offset: u64,
    ) -> Result<Box<dyn ByteStream>> {
        let session = self.sessions.session(&descriptor.source).await?;
        let response = if offset > 0 {
            session.get_range(&descriptor.url, offset, None).await?
        } else {
            session.get(&descriptor.url).await?
        };
        let resumed = offset > 0 && response.is_partial();
        Ok(Box::new(HttpStream { response, resumed }))
    }
}

struct HttpStream {
    response: SessionResponse,
    resumed: bool,
}

#[async_trait]
impl ByteStream for HttpStream {
    fn resumed(&self) -> bool {
        self.resumed
    }

    fn total_size(&self) -> Option<u64> {
        self.response.total_size()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.response.chunk().await
    }
}
