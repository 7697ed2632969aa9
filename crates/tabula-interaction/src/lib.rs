//! Remote API layer for Tabula.
//!
//! reqwest implementations of the `TableApi` and `TokenIssuer` seams for the
//! Finance OS table endpoints and the JWT token endpoints.

pub mod finance_os_client;
pub mod response;
pub mod token_client;

pub use finance_os_client::HttpTableApi;
pub use token_client::HttpTokenIssuer;
