pub mod balancer;
pub mod config;
pub mod establish;
pub mod proxy;
pub mod relay;
