pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod error_utils;
pub mod filter;
pub mod rotation;
pub mod types;

pub use checkpoint::*;
pub use clock::*;
pub use config::*;
pub use dedup::*;
pub use error::*;
pub use error_utils::*;
pub use filter::*;
pub use rotation::*;
pub use types::*;
