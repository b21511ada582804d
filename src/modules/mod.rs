// modules - app-level helpers (config file handling, logging)

pub mod config;
pub mod logger;
