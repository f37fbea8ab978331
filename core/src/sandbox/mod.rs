//! Ephemeral cluster sandbox.
//!
//! This module provides the [`ClusterProvider`] trait for creating the
//! disposable single-node cluster and the [`ClusterBootstrapper`]
//! implementation driving a container engine.

mod bootstrapper;
mod checkout;
mod engine;
mod provider;
mod recipe;

pub use bootstrapper::ClusterBootstrapper;
pub use checkout::Checkout;
pub use engine::{ContainerEngine, ContainerSpec, Mount};
pub use provider::{ClusterProvider, ClusterSandbox};
pub use recipe::{BinaryCopy, ImageRecipe};
