//! The device connection as the transfer engine sees it.
use super::request::{Request, Response};
use thiserror::Error;

/// Transport failure below the request/response layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link timed out waiting for the device")]
    Timeout,

    /// The connection is gone; nothing on this link will succeed again.
    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// `{io}`-class failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LinkError::Closed)
    }
}

/// Request/response access to one device, supplied by the driver.
///
/// The driver serializes calls; the engine never has two in flight.
#[allow(async_fn_in_trait)]
pub trait Link {
    /// Send one request and wait for its response.
    async fn transact(&mut self, req: &Request) -> Result<Response, LinkError>;

    /// Write raw bytes (an encoded chunk plus its delimiter) to the device.
    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
}
