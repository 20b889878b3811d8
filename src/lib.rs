//! Multi-stage service-request (OS) pipeline.
//!
//! Each stage keeps a per-OS status table in SQLite and hands work to the
//! next stage through durable FIFO queues. See [`stages`] for the download,
//! triage and tomados workers and [`scheduler`] for the loop driving them.

pub mod cli;
pub mod config;
pub mod migrations;
pub mod models;
pub mod policy;
pub mod repository;
pub mod scheduler;
pub mod schema;
pub mod services;
pub mod stages;
pub mod utils;
pub mod work_queue;
