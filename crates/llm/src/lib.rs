pub mod budget;
pub mod http;
pub mod provider;
pub mod runner;
