pub mod parse_log;
pub mod serve;
pub mod validate;
