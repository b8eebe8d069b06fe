pub mod health_handlers;
pub mod queue_handlers;
pub mod upload_handlers;
