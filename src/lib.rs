pub mod auth;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod dispatch;
mod error;
pub mod forward;
pub mod logging;
pub mod upstream;
pub mod utils;

#[cfg(feature = "gateway")]
pub mod gateway;

pub use auth::token::{CacheStats, Token, TokenIssuer, TokenPolicy, TokenSource, validate_token};
pub use balancer::{BalancerStats, LoadBalancer};
pub use clock::{Clock, SystemClock};
pub use config::{Env, ProxySettings};
pub use credentials::{CredentialPool, CredentialRecord};
pub use dispatch::{DispatchState, Dispatcher, Prepared, Rejection};
pub use error::{
    ErrorCode, FieldIssue, ForwardFailure, ForwardFailureKind, ProxyError, RecordIssue, Result,
};
pub use forward::{ErrorReply, Forwarder, ProxyRequest, RequestFilter, UpstreamTarget};
pub use upstream::{OutboundRequest, ReqwestUpstream, Upstream, UpstreamResponse};
