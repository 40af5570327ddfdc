pub(crate) mod api;
pub mod auth;
pub mod config;
pub mod convert;
pub mod error;
pub mod eventstream;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;
