//! Inbound signal HTTP API (spec.md §6): `POST /api/signal`,
//! `GET /api/signal/latest`, `GET /api/signal/{market_start}`,
//! `GET /api/health`. Grounded on the teacher's `web-api` crate's
//! axum router/handler split.

pub mod handlers;
pub mod server;

pub use server::{ApiServer, ApiState};
