//! Language-model backends for SlowHands.
//!
//! All backends implement the `slowhands_core::Provider` trait. The
//! [`BackendGateway`] wraps whichever one is configured with rate limiting,
//! circuit breaking, and retries; nothing else in the workspace calls a
//! provider directly.

pub mod backend_gateway;
pub mod openai_compat;
pub mod router;

pub use backend_gateway::{BackendGateway, GatewayStatus};
pub use openai_compat::OpenAiCompatProvider;
pub use router::{build_from_config, default_base_url, resolve_model};
