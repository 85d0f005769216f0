pub mod api;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod endpoint;
pub mod enrich;
pub mod event;
pub mod external_id;
pub mod failure_sink;
pub mod limiters;
pub mod pii;
pub mod pipeline;
pub mod policy;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod time;
pub mod validation;
