//! Prometheus text exposition of pool scale state.

use fleetgrid_state::{PoolScaleState, ScaleOutcome};

const OUTCOMES: [ScaleOutcome; 4] = [
    ScaleOutcome::Success,
    ScaleOutcome::PartialSuccess,
    ScaleOutcome::Failure,
    ScaleOutcome::NoOp,
];

/// Render per-pool gauges. Pools that have never been evaluated are
/// skipped for the count gauges.
pub fn render_prometheus(states: &[PoolScaleState], tracked_terminations: usize) -> String {
    let mut out = String::new();

    out.push_str("# HELP fleetgrid_pool_current_agents Agents counted in the pool at the last evaluation.\n");
    out.push_str("# TYPE fleetgrid_pool_current_agents gauge\n");
    for s in states {
        if let Some(n) = s.last_agent_count {
            out.push_str(&format!(
                "fleetgrid_pool_current_agents{{pool=\"{}\"}} {}\n",
                s.pool_id, n
            ));
        }
    }

    out.push_str("# HELP fleetgrid_pool_desired_agents Desired pool size at the last evaluation.\n");
    out.push_str("# TYPE fleetgrid_pool_desired_agents gauge\n");
    for s in states {
        if let Some(n) = s.last_desired_agent_count {
            out.push_str(&format!(
                "fleetgrid_pool_desired_agents{{pool=\"{}\"}} {}\n",
                s.pool_id, n
            ));
        }
    }

    out.push_str("# HELP fleetgrid_pool_last_scale_outcome Outcome of the last scale attempt (1 = current).\n");
    out.push_str("# TYPE fleetgrid_pool_last_scale_outcome gauge\n");
    for s in states {
        let Some(result) = &s.last_scale_result else {
            continue;
        };
        for outcome in OUTCOMES {
            out.push_str(&format!(
                "fleetgrid_pool_last_scale_outcome{{pool=\"{}\",outcome=\"{}\"}} {}\n",
                s.pool_id,
                outcome,
                u8::from(result.outcome == outcome)
            ));
        }
    }

    out.push_str("# HELP fleetgrid_pool_last_agents_added Agents added by the last scale attempt.\n");
    out.push_str("# TYPE fleetgrid_pool_last_agents_added gauge\n");
    for s in states {
        if let Some(result) = &s.last_scale_result {
            out.push_str(&format!(
                "fleetgrid_pool_last_agents_added{{pool=\"{}\"}} {}\n",
                s.pool_id, result.agents_added_count
            ));
        }
    }

    out.push_str("# HELP fleetgrid_pool_last_agents_removed Agents removed by the last scale attempt.\n");
    out.push_str("# TYPE fleetgrid_pool_last_agents_removed gauge\n");
    for s in states {
        if let Some(result) = &s.last_scale_result {
            out.push_str(&format!(
                "fleetgrid_pool_last_agents_removed{{pool=\"{}\"}} {}\n",
                s.pool_id, result.agents_removed_count
            ));
        }
    }

    out.push_str("# HELP fleetgrid_lifecycle_tracked_terminations Terminations waiting for agents to drain.\n");
    out.push_str("# TYPE fleetgrid_lifecycle_tracked_terminations gauge\n");
    out.push_str(&format!(
        "fleetgrid_lifecycle_tracked_terminations {tracked_terminations}\n"
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::ScaleResult;

    fn evaluated(pool: &str) -> PoolScaleState {
        PoolScaleState {
            last_agent_count: Some(4),
            last_desired_agent_count: Some(6),
            last_scale_result: Some(ScaleResult::new(ScaleOutcome::Success, 2, 0, "added")),
            ..PoolScaleState::new(pool)
        }
    }

    #[test]
    fn render_single_pool() {
        let output = render_prometheus(&[evaluated("win")], 3);
        assert!(output.contains("fleetgrid_pool_current_agents{pool=\"win\"} 4"));
        assert!(output.contains("fleetgrid_pool_desired_agents{pool=\"win\"} 6"));
        assert!(output.contains(
            "fleetgrid_pool_last_scale_outcome{pool=\"win\",outcome=\"success\"} 1"
        ));
        assert!(output.contains(
            "fleetgrid_pool_last_scale_outcome{pool=\"win\",outcome=\"no_op\"} 0"
        ));
        assert!(output.contains("fleetgrid_pool_last_agents_added{pool=\"win\"} 2"));
        assert!(output.contains("fleetgrid_lifecycle_tracked_terminations 3"));
    }

    #[test]
    fn unevaluated_pools_have_no_samples() {
        let output = render_prometheus(&[PoolScaleState::new("fresh")], 0);
        assert!(output.contains("# TYPE fleetgrid_pool_current_agents gauge"));
        assert!(!output.contains("pool=\"fresh\""));
    }
}
