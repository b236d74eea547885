//! Bearer-credential validation.
//!
//! Credential issuance and user storage live in an external service; the
//! core only validates the tokens presented at the socket handshake and on
//! the SOS endpoint.

pub mod jwt;

pub use jwt::{Claims, JwtHandler, TokenError};
