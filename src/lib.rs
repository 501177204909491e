//! Active deception control plane for a Kubernetes web workload.
//!
//! Three components share this crate:
//!
//! - [`gateway`] — the ingress reverse proxy. Ordinary traffic flows to the
//!   legitimate upstream; addresses in the block table are fanned out
//!   round-robin across their decoy fleet.
//! - [`detector`] — tails the upstream pods' logs, classifies lines against
//!   a fixed rule set with per-address sliding windows, and alerts the
//!   controller with per-address cooldown.
//! - [`controller`] — turns alerts into `AttackResponse` resources and
//!   reconciles each one into a three-variant decoy fleet, isolation
//!   policies, and a gateway block entry, all torn down at the TTL.

pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod runtime;
