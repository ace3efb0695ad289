pub mod blood;
pub mod config;
pub mod gateway;
pub mod model;
pub mod notice;
pub mod outbox;
pub mod resource;
pub mod sender;
pub mod settings;
