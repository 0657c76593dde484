// Library entry point for the binary and the integration tests.

pub mod api;
pub mod capture;
pub mod cluster_manager;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod instance_lock;
pub mod matcher;
pub mod port_forward;
pub mod receiver;
pub mod registry;
pub mod state_machine;
pub mod termination;
pub mod transfer;

pub use api::{create_router, AppState};
pub use config::HandoffConfig;
pub use coordinator::{HandoffCoordinator, HandoffOutcome};
