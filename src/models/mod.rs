//! Core data models for the cloud storage service.
//!
//! Everything here serializes with camelCase field names so documents written
//! to the table stay readable by other services on the platform.

pub mod job;
pub mod locator;
pub mod restore;
pub mod work_item;
