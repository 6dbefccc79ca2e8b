pub mod api;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod host_url;
pub mod killer;
pub mod launch;
pub mod logs;
pub mod orchestrator;
pub mod port_alloc;
pub mod process_manager;
pub mod workspace;

pub use config::AgentConfig;
pub use error::SessionError;
pub use orchestrator::{DeletePreview, Orchestrator, StartInfo};
