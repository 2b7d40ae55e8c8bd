// src/lib.rs
pub mod calibration;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod export;
pub mod recorder;
pub mod settings;
pub mod types;
pub mod window;
