//! HTTP surface: admission middleware, caller resolution and the server.

mod caller;
mod middleware;
mod response;
mod routes;
mod server;

pub use caller::{client_ip, BotPathResolver, CallerResolver, FORWARDED_FOR};
pub use middleware::{AdmissionLayer, AdmissionPolicy, AdmissionService};
pub use response::{apply_quota_headers, json_error, ApiError};
pub use routes::app;
pub use server::HttpServer;
