mod backend;
mod config;
mod machine;
mod prerequisites;
mod process;

pub use backend::FirecrackerBackend;
pub use config::FirecrackerConfig;
pub use machine::{FirecrackerMachine, build_config, config_file_path};
pub use prerequisites::{check_prerequisites, resolve_binary};
