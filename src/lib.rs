//! Dispatch and cancellation of nonce searches on compute engines.
//!
//! A controller stages work in a [`ParameterBlock`](backend::params::ParameterBlock),
//! hands it to an engine through a [`ControlHandle`] and blocks until the engine
//! reports. Engines are either a direct call on the controller's processor
//! ([`backend::local`]) or a separate execution unit reached only through
//! transfers and a one-bit stop signal ([`backend::isolated`]).

pub mod backend;
pub mod binding;
pub mod error;
pub mod handle;

pub use binding::{physical_engines, usable_engines, Miner, Realization};
pub use error::{MinerError, Result};
pub use handle::{ControlHandle, RunOutcome};
