pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod observer;
pub mod quantity;
pub mod registry;
pub mod remote;
pub mod reorder;
pub mod saving;
pub mod scheduler;
pub mod session;
pub mod store;
