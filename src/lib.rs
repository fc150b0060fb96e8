pub mod config;
pub mod database;
pub mod error;
pub mod event_store;
pub mod handlers;
pub mod inventory;
pub mod loop_detector;
pub mod message_broker;
pub mod notification;
pub mod query;
pub mod scheduler;
pub mod trade;
