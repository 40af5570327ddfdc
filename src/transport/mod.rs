mod backend;
mod retry_policy;

pub use backend::{summarize_error_body, BackendClient};
