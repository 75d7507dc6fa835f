//! Session state shared between the primary and its workers

pub mod run_config;
pub mod state;

pub use run_config::{
    ArtifactPlugins, ArtifactsConfig, BehaviorConfig, CleanupBehavior, InitBehavior,
    LogPluginConfig, RunConfig, SessionConfig,
};
pub use state::SessionState;
