#![doc = "Common types shared across the CATio workspace."]

pub mod ads_types;
pub mod config;
pub mod error;
pub mod net_id;
pub mod state;
pub mod time;

pub use ads_types::*;
pub use config::*;
pub use error::*;
pub use net_id::*;
pub use state::*;
pub use time::*;
