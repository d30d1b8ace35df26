pub mod backoff;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod observer;
pub mod rest;
pub mod validate;
