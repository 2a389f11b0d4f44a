//! Aula: hall-booking approval and exam-seat allotment engine.
//!
//! The concurrency-sensitive core of a campus administration system:
//! a two-stage booking approval workflow with interval conflict checking,
//! plus exam-seat allotment with seat/student/capacity uniqueness, served
//! over the Postgres wire protocol.

pub mod auth;
pub mod campus;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
