pub mod bridge;
pub mod queue_service;
pub mod storage_service;
