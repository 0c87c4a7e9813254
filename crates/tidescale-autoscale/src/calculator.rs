//! Desired-capacity calculator.
//!
//! ```text
//! raw     = round(current_utilization * current_nodes / target_utilization)
//! if current_nodes - raw > max_scale_down_nodes:
//!     raw = current_nodes - max_scale_down_nodes
//! desired = clamp(raw, min_nodes, max_nodes)
//! ```
//!
//! Pure and total over validated policies. `target_utilization == 0` is
//! rejected at admission and never reaches this module.

use tidescale_core::{AutoscalePolicy, Rounding};

/// Inputs to one capacity calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityInput {
    pub current_utilization: u32,
    pub current_nodes: u32,
    pub target_utilization: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub max_scale_down_nodes: u32,
}

impl CapacityInput {
    /// Assemble inputs from a policy and the observed utilization/capacity.
    pub fn from_policy(policy: &AutoscalePolicy, current_utilization: u32, current_nodes: u32) -> Self {
        Self {
            current_utilization,
            current_nodes,
            target_utilization: policy.target_utilization,
            min_nodes: policy.min_nodes,
            max_nodes: policy.max_nodes,
            max_scale_down_nodes: policy.effective_max_scale_down_nodes(),
        }
    }
}

/// Compute the node count the cluster should run.
pub fn desired_nodes(input: &CapacityInput, rounding: Rounding) -> u32 {
    debug_assert!(input.target_utilization > 0, "target utilization must be validated");

    // Widen so utilization above 100% on large clusters cannot overflow.
    let total_load = u64::from(input.current_utilization) * u64::from(input.current_nodes);
    let target = u64::from(input.target_utilization.max(1));
    let quotient = match rounding {
        Rounding::Ceiling => total_load.div_ceil(target),
        Rounding::Floor => total_load / target,
    };
    let mut desired = u32::try_from(quotient).unwrap_or(u32::MAX);

    if input.current_nodes.saturating_sub(desired) > input.max_scale_down_nodes {
        desired = input.current_nodes - input.max_scale_down_nodes;
    }

    desired.clamp(input.min_nodes, input.max_nodes.max(input.min_nodes))
}
