//! Scale-decision policy — cooldown gating between scaling actions.
//!
//! Scale-up and scale-down each have their own cooldown window measured
//! from the last issued scale command. The windows prevent rapid
//! oscillation when utilization hovers around the target.

use std::time::Duration;

use tracing::{debug, info};

/// Direction of a proposed capacity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Outcome of the decision policy for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Desired equals current.
    NoAction,
    /// A change is wanted but its cooldown window has not elapsed.
    Deferred(Direction),
    /// Issue the scale command now.
    Act(Direction),
}

impl ScaleDecision {
    pub fn is_act(&self) -> bool {
        matches!(self, ScaleDecision::Act(_))
    }
}

/// Cooldown windows since the last scale command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldowns {
    pub scale_up: Duration,
    pub scale_down: Duration,
}

impl Cooldowns {
    /// Window length in whole seconds. Sub-second remainders round up.
    fn window_secs(&self, direction: Direction) -> u64 {
        let window = match direction {
            Direction::Up => self.scale_up,
            Direction::Down => self.scale_down,
        };
        window.as_secs() + u64::from(window.subsec_nanos() > 0)
    }
}

/// Decide whether a scaling action is due.
///
/// Times are unix seconds.
pub fn decide(
    current_nodes: u32,
    desired_nodes: u32,
    last_scale_time: u64,
    now: u64,
    cooldowns: &Cooldowns,
) -> ScaleDecision {
    let direction = match desired_nodes.cmp(&current_nodes) {
        std::cmp::Ordering::Equal => {
            debug!(current_nodes, "desired node count equals current; no need to scale");
            return ScaleDecision::NoAction;
        }
        std::cmp::Ordering::Greater => Direction::Up,
        std::cmp::Ordering::Less => Direction::Down,
    };

    let ready_at = last_scale_time.saturating_add(cooldowns.window_secs(direction));
    if now < ready_at {
        info!(
            ?direction,
            now,
            last_scale_time,
            ready_at,
            "too soon to scale since the last scaling action"
        );
        return ScaleDecision::Deferred(direction);
    }

    ScaleDecision::Act(direction)
}
