//! Wardrobe analysis pipeline
//!
//! This library provides the core functionality for the wardrobe pipeline:
//! a durable job queue with bounded retries, the worker pool that drains it,
//! and the orchestrator that turns processed clothing photos into structured
//! metadata using Cloudflare Workers AI and R2 storage.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
