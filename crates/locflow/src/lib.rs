pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod pipeline;
