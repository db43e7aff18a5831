pub mod bridge;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod remote;
pub mod sync;
