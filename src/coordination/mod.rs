//! Lifecycle orchestration of a distributed run
//!
//! The primary context performs global setup and teardown and hosts the IPC
//! bus; worker contexts join it from their own processes. Environment-specific
//! behavior is injected through the collaborator traits.

pub mod collaborators;
pub mod context;
pub mod primary;
pub mod worker;

pub use collaborators::{
    AuxiliaryServer, AuxiliaryServerFactory, ConfigResolver, GlobalLifecycleHandler,
    JsonFileConfigResolver, LoopbackServer, LoopbackServerFactory, NoopLifecycleHandler,
    StaticConfigResolver,
};
pub use context::{RunContext, SetupOptions, WorkerRuntime};
pub use primary::{ContextDependencies, ContextDependenciesBuilder, PrimaryContext, TeardownReport};
pub use worker::WorkerContext;
