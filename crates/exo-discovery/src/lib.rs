//! Backend discovery for the exo connection layer.
//!
//! Provides:
//! - `ContainerRuntime` trait and the `DockerCli` implementation
//! - `PortProber` trait and the `TcpProber` health check
//! - Selection of a backend among health-checked candidates
//! - `LastUsedStore` implementations (memory, JSON file)
//! - `Discovery` - the pass tying them together

pub mod candidate;
pub mod command;
pub mod discovery;
pub mod environment;
pub mod probe;
pub mod runtime;
pub mod selection;
pub mod storage;

pub use candidate::{Candidate, HealthOutcome, HealthResult, Rejection};
pub use command::{CommandError, Invocation, RuntimeCommand};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError, Resolution};
pub use environment::running_in_container;
pub use probe::{PortProber, TcpProber};
pub use runtime::{ContainerRuntime, DockerCli, DockerCliConfig, LaunchTemplate, RuntimeError};
pub use storage::{FileStore, LastUsedStore, MemoryStore, StorageError};
