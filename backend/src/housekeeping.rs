use crate::service::Service;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

const COUNTER_SWEEP_EVERY: Duration = Duration::from_secs(300);

/// Periodically re-derive like and vote counters from their join tables.
pub fn run_housekeeping(service: Service) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(COUNTER_SWEEP_EVERY);
        loop {
            tick.tick().await;
            match service.recompute_counters() {
                Ok(0) => {}
                Ok(fixed) => info!(fixed, "counters repaired"),
                Err(e) => warn!(error = %e, "counter sweep failed"),
            }
        }
    })
}
