pub mod app_config;
pub mod database;
pub mod events;
pub mod keys;
pub mod redis_repo;
pub mod scripts;

pub use database::DbClient;
pub use events::{deliver, Delivery, EventConsumer, HandlerError, MessageHandler, RetryPolicy};
pub use keys::KeySpace;
pub use redis_repo::RedisClient;
