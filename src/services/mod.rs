pub mod consistency;
pub mod gateway_events;
pub mod health_monitor;
pub mod migration;
pub mod payment_rules;
pub mod sync_engine;
pub mod sync_log;
