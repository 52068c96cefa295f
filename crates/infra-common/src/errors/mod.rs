/*!
Error types shared across the amistat crates.
*/

pub mod types;

pub use types::{Error, Result};
