//! Site insight: URL analysis jobs.
//!
//! The API server accepts URLs and records jobs; the worker loads each page
//! in headless Chromium, screenshots it, asks a vision model to describe the
//! design, and stores the result for the submitter to poll.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
mod testing;
