//! Bearer token minting for upstream authentication.

pub mod token;

pub use token::{
    CacheStats, Token, TokenClaims, TokenIssuer, TokenPolicy, TokenSource, validate_token,
};
