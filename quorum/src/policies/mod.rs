//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - HostListener: notified when hosts go up or down,
//! - LoadBalancingPolicy: orders hosts for each request and sizes their pools,
//! - RetryPolicy: decides what to do after server-side timeouts and unavailable errors,
//! - SchemaAgreementWaiter: waits for the cluster to agree on the schema after DDL.

pub mod host_listener;
pub mod load_balancing;
pub mod retry;
pub mod schema_agreement;
