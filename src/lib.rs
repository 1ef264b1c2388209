//! Single-site news ingestion: fetch, extract, validate, persist with a JSON backup,
//! and publish live progress to concurrent observers.
//!
//! [`pipeline::Pipeline`] is the entry point; everything else is a stage it drives.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod utils;
pub mod validator;
