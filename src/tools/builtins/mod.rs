pub mod fs;
pub mod get_time;
