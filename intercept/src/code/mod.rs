pub mod patcher;
pub mod region;

pub use patcher::{page_size, write_pointer};
pub use region::{overwrite_occurrences, set_anon_name};
