//! Waiting for a group of agents to settle.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use twoway_config::HarnessConfig;

use crate::agent::TestAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiescenceOptions {
    /// Interval between busy checks.
    pub poll: Duration,
    /// Give up after this long, settled or not.
    pub ceiling: Duration,
}

impl QuiescenceOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        QuiescenceOptions {
            poll: config.timeouts.quiescence_poll.as_duration(),
            ceiling: config.timeouts.quiescence_ceiling.as_duration(),
        }
    }
}

/// [`wait_on_syncs_with`] using the first agent's configured poll interval
/// and ceiling.
pub fn wait_on_syncs(window: Duration, agents: &[&TestAgent]) -> bool {
    let Some(first) = agents.first() else {
        return true;
    };
    let options = QuiescenceOptions::from_config(first.context().config());
    wait_on_syncs_with(&options, window, agents)
}

/// Block until no agent has been busy for `window` and none has seen an
/// engine callback for `window`. Once the agents have been idle for half
/// the window, one extra sync-down pass is requested from each of them;
/// the wait cannot end before that pass has been asked for.
///
/// Returns false if the ceiling is reached first.
pub fn wait_on_syncs_with(
    options: &QuiescenceOptions,
    window: Duration,
    agents: &[&TestAgent],
) -> bool {
    let start = Instant::now();
    let mut idle_since = Instant::now();
    let mut forced = false;

    loop {
        let checks: Vec<_> = agents.iter().map(|a| a.is_busy()).collect();
        let mut busy = false;
        for (agent, check) in agents.iter().zip(checks) {
            match check.wait() {
                Ok(true) => busy = true,
                Ok(false) => {}
                Err(e) => {
                    warn!("{}: busy check failed: {}", agent.name(), e);
                    busy = true;
                }
            }
        }

        let now = Instant::now();
        if busy {
            idle_since = now;
        }
        let idle = now.saturating_duration_since(idle_since);

        if !forced && idle >= window / 2 {
            debug!("Requesting a last sync-down pass from {} agent(s)", agents.len());
            let requests: Vec<_> = agents.iter().map(|a| a.request_sync_down()).collect();
            for (agent, request) in agents.iter().zip(requests) {
                if let Err(e) = request.wait() {
                    warn!("{}: sync-down request failed: {}", agent.name(), e);
                }
            }
            forced = true;
        }

        let quiet = agents
            .iter()
            .all(|a| now.saturating_duration_since(a.last_callback()) >= window);
        if forced && idle >= window && quiet {
            debug!("Agents settled after {:?}", start.elapsed());
            return true;
        }

        if start.elapsed() >= options.ceiling {
            warn!(
                "Agents still not settled after {:?}, giving up",
                options.ceiling
            );
            return false;
        }
        thread::sleep(options.poll);
    }
}

/// Issue a catch-up barrier on every agent and wait for all of them.
pub fn catchup_agents(agents: &[&TestAgent]) -> bool {
    info!("Catching up {} agent(s)", agents.len());
    let barriers: Vec<_> = agents.iter().map(|a| a.catchup_future()).collect();
    let mut ok = true;
    for (agent, barrier) in agents.iter().zip(barriers) {
        if let Err(e) = barrier.resolve() {
            warn!("{}: catchup failed: {}", agent.name(), e);
            ok = false;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use twoway_config::HumanDuration;

    #[test]
    fn test_options_from_config() {
        let mut config = HarnessConfig::default();
        config.timeouts.quiescence_poll = HumanDuration::from_millis(25);
        config.timeouts.quiescence_ceiling = HumanDuration::from_secs(3);
        let options = QuiescenceOptions::from_config(&config);
        assert_eq!(options.poll, Duration::from_millis(25));
        assert_eq!(options.ceiling, Duration::from_secs(3));
    }

    #[test]
    fn test_no_agents_is_settled() {
        assert!(wait_on_syncs(Duration::from_secs(60), &[]));
        assert!(catchup_agents(&[]));
    }
}
