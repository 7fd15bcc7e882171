//! Cloud object transfer engine: resumable multi-file copies between S3,
//! Azure Blob Storage and HTTP sources, plus archive restore coordination.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod operations;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testutil;
