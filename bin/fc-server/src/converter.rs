//! Provider body conversion capability, stubbed to a passthrough. The
//! lookup table shape (`serviceType -> Arc<dyn Converter>`) is kept so a
//! concrete per-provider converter can be dropped in later without
//! touching the ingress handlers.

use async_trait::async_trait;
use bytes::Bytes;
use fc_common::ServiceType;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Rewrites an inbound request body for the target `serviceType`. The
    /// passthrough implementation returns `body` unchanged.
    async fn build_upstream_request(&self, body: Bytes) -> Bytes {
        body
    }

    /// Rewrites an upstream response body back into the client-facing wire
    /// form. The passthrough implementation returns `body` unchanged.
    async fn parse_response(&self, body: Bytes) -> Bytes {
        body
    }
}

pub struct PassthroughConverter;

#[async_trait]
impl Converter for PassthroughConverter {}

const PASSTHROUGH: PassthroughConverter = PassthroughConverter;

/// Every `serviceType` resolves to the passthrough converter today; the
/// lookup exists so a concrete per-provider implementation has somewhere to
/// register itself.
pub fn converter_for(_service_type: ServiceType) -> &'static PassthroughConverter {
    &PASSTHROUGH
}
