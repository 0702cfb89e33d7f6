//! Gateway between chat front-ends and a paid model API: per-subject
//! admission control, tier routing, and a circuit-broken retry loop.

pub mod gateway;

#[doc(hidden)]
pub mod test_support;

pub use gateway::{
    Gateway, GatewayBuilder, GatewayConfig, GatewayError, ModelTier, Plan, SubmitResponse,
    Upstream, UpstreamError, UpstreamReply,
};
