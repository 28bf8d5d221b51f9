//! Ridewire - ride dispatch over a topic message bus
//!
//! Services coordinate by choreography: each reacts to events on the `trip`
//! topic exchange and publishes the next one. Delivery is at-least-once
//! with bounded retry and a dead-letter queue.

pub mod bus;
pub mod config;
pub mod contracts;
pub mod delivery;
pub mod dispatch;
pub mod dlq;
pub mod drivers;
pub mod gateway;
pub mod payment;
pub mod trip;
pub mod utils;
