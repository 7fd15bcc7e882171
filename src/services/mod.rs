pub mod azure;
pub mod checkpoint;
pub mod document_table;
pub mod file_copier;
pub mod http_source;
pub mod job_assignment;
pub mod probe;
pub mod restore_monitor;
pub mod restore_registry;
pub mod s3;
pub mod storage_clients;
pub mod transfer;
pub mod worker_invoker;
