//! Client-side lifecycle controller for repository analysis jobs.
//!
//! [`controller::JobController`] starts or re-attaches to a backend analysis job, follows
//! it over one [`transport::TransportSession`] (server-sent events or status polling),
//! accumulates results in a [`store::ResultStore`] and exposes month-windowed views.

pub mod backend;
pub mod cli;
pub mod commit;
pub mod controller;
pub mod error;
pub mod logging;
pub mod model;
pub mod repo_key;
pub mod report;
pub mod run;
pub mod store;
pub mod transport;
pub mod util;
pub mod window;
