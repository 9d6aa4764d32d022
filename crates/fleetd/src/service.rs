//! Device registration service client interface.

use crate::error::ServiceError;
use crate::keys::SignedRequest;
use fleet_shared::{Assertion, Serial};

/// A signed serial request plus what travels along with it.
#[derive(Debug, Clone)]
pub struct SerialRequest {
    pub request: SignedRequest,
    /// Extra assertions backing the request (re-registration)
    pub ancillary: Vec<Assertion>,
    /// Gadget whose configuration selects the service endpoint
    pub gadget: String,
}

pub trait DeviceService: Send + Sync {
    /// Fetches a fresh request id to embed in the next request.
    fn request_id(&self) -> Result<String, ServiceError>;

    /// Submits a request. `Err(ServiceError::Poll)` means "ask again later".
    fn submit(&self, req: &SerialRequest) -> Result<Serial, ServiceError>;
}

/// Service used when no endpoint is configured; every call is transient.
pub struct UnconfiguredDeviceService;

impl DeviceService for UnconfiguredDeviceService {
    fn request_id(&self) -> Result<String, ServiceError> {
        Err(ServiceError::Transient("no device service configured".to_string()))
    }

    fn submit(&self, _req: &SerialRequest) -> Result<Serial, ServiceError> {
        Err(ServiceError::Transient("no device service configured".to_string()))
    }
}
