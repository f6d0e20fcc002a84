pub mod bots;
pub mod config;
pub mod credentials;
pub mod line_reader;
pub mod log_file;
pub mod log_tail;
pub mod process;
pub mod queue;
pub mod runner;
pub mod workspace;
