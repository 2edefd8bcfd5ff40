pub mod config;
pub mod events;
pub mod pages;
pub mod sse;
pub mod tasks;
