/*!
Configuration loading.

Configuration types are plain serde structs; this module only knows how to
read them from TOML and run their validation.
*/

pub mod schema;

pub use schema::{load_toml_file, load_toml_str, SelfValidating};
