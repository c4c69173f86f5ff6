//! Kata Containers runtime provider for Corral.
//!
//! Each runtime is one Kubernetes pod whose `runtimeClassName` selects the Kata
//! micro-VM runtime. Commands and file transfers travel over the exec
//! subresource. Snapshots archive the working directory and restore it into a
//! fresh pod.
//!
//! The provider talks to the cluster only through [`PodApi`]. [`KubePodApi`]
//! is the live implementation; [`MockPodApi`] keeps pods and their files in
//! memory for tests.

pub mod api;
pub mod cluster;
pub mod config;
mod exec;
pub mod files;
pub mod mock;
pub mod network;
pub mod pod;
pub mod provider;
pub mod shell;
pub mod template;

pub use api::{ApiError, ExecFrame, ExecStream, PodApi};
pub use cluster::KubePodApi;
pub use config::KataConfig;
pub use files::PodFiles;
pub use mock::{MockBehavior, MockPodApi};
pub use provider::KataRuntimeProvider;
pub use template::PodTemplate;
