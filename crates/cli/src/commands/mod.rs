pub mod agent;
pub mod config_cmd;
pub mod serve;
pub mod status;
