//! Port Monitor (spec §4.6). One long-running task: periodically
//! enumerate ports, match against the Adapter Registry, and hand the first
//! candidate to the Board Session. Grounded in the original agent's
//! `monitor.go`, the authoritative revision per spec §9 design notes (the
//! earlier `main.go` `monitorSerialPorts` is superseded).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::context::AgentContext;
use crate::transport::enumerate_ports;

const TICK: Duration = Duration::from_millis(10);
const NO_BOARD_WINDOW: Duration = Duration::from_secs(5);

/// Runs the monitor loop until `stop` is set. Intended to be the body of a
/// dedicated thread spawned from `main`.
pub fn run(ctx: Arc<AgentContext>, stop: Arc<AtomicBool>) {
    let mut no_board_since = Instant::now();
    let mut last_candidate_count = 0usize;

    while !stop.load(Ordering::Acquire) {
        if ctx.is_upgrading() {
            thread::sleep(TICK);
            continue;
        }

        if ctx.session.is_attached() {
            if ctx.session.probe_liveness().is_err() {
                warn!("board liveness probe failed, detaching session");
                ctx.session.detach();
                no_board_since = Instant::now();
            } else {
                thread::sleep(TICK);
                continue;
            }
        }

        let ports = enumerate_ports().unwrap_or_default();
        let candidates = {
            let registry = ctx.registry.lock().unwrap();
            ports
                .into_iter()
                .filter(|p| registry.matches(p))
                .collect::<Vec<_>>()
        };

        if candidates.len() != last_candidate_count {
            debug!(count = candidates.len(), "candidate board count changed");
            ctx.session.notify_scanning(candidates.len());
            last_candidate_count = candidates.len();
        }

        let mut attached_now = false;
        for port in &candidates {
            let prereqs = ctx.prerequisites.as_deref();
            let commit_index = ctx.commit_index.as_deref();
            match ctx.session.attach(port, prereqs, commit_index) {
                Ok(()) => {
                    attached_now = true;
                    break;
                }
                Err(e) => {
                    debug!(port = %port.device_name, error = %e, "attach failed, trying next candidate");
                }
            }
        }

        if attached_now {
            no_board_since = Instant::now();
        } else if !ctx.session.is_attached() && no_board_since.elapsed() >= NO_BOARD_WINDOW {
            ctx.session.notify_no_board();
            no_board_since = Instant::now();
        }

        thread::sleep(TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn stops_promptly_when_signalled() {
        let ctx = Arc::new(AgentContext::new(AgentConfig::default()));
        let stop = Arc::new(AtomicBool::new(true));
        run(ctx, stop);
    }
}
