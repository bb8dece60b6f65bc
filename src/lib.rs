//! Adaptive 2-D midpoint integration on a Vulkan compute queue.
//!
//! The kernel is dispatched at increasing resolution until successive results
//! agree to within the configured absolute or relative error, or the
//! iteration cap is hit. Everything below `main` reports failures as
//! [`Error`] values.

pub mod backend;
pub mod config;
pub mod error;
pub mod integrand;
pub mod integrator;

pub use config::Config;
pub use error::{Error, ExitStatus, Result};
pub use integrand::Integrand;
pub use integrator::{integrate, Outcome};
