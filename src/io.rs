pub mod cache;
pub mod config;
pub mod export;
pub mod image;
pub mod loader;
pub mod obj_loader;
