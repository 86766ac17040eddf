pub mod collection;
pub mod condition;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod lanes;
pub mod log;
pub mod stage;
pub mod stages;
pub mod types;
