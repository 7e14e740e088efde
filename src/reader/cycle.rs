use super::ReductionPolicy;
use crate::model::{Metric, MetricReadings};
use crate::sensor::{HarvestError, ReadingsPipe, Sensor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Result of one harvest cycle
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub readings: MetricReadings,
    pub errors: Vec<HarvestError>,
    /// Sensors dispatched in this cycle
    pub dispatched: usize,
    /// True if the deadline elapsed before every sensor reported
    pub timed_out: bool,
}

/// Runs one harvest cycle.
///
/// Every sensor harvests concurrently into a fresh [`ReadingsPipe`]. The cycle
/// ends when all sensors have returned or `timeout` elapses, whichever comes
/// first; sensors still running are aborted and their partial writes are
/// discarded.
/// Each requested metric is then reduced with `policy`, and metrics without a
/// single result are left out of the readings.
pub async fn run_cycle(
    sensors: Vec<Arc<dyn Sensor>>,
    metrics: &[Metric],
    timeout: Duration,
    policy: ReductionPolicy,
) -> CycleOutcome {
    let pipe = ReadingsPipe::new(metrics);
    let mut harvests = JoinSet::new();

    for sensor in sensors {
        let ctx = pipe.context(sensor.id());
        harvests.spawn(async move {
            sensor.harvest(&ctx).await;
            sensor.id().to_string()
        });
    }

    let dispatched = harvests.len();
    let mut completed = HashSet::with_capacity(dispatched);

    let finished = tokio::time::timeout(timeout, async {
        while let Some(joined) = harvests.join_next().await {
            match joined {
                Ok(id) => {
                    completed.insert(id);
                }
                Err(e) => error!(error = %e, "Sensor harvest task failed"),
            }
        }
    })
    .await;

    let timed_out = finished.is_err();
    if timed_out {
        debug!(
            pending = harvests.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Harvest deadline elapsed, dropping slow sensors"
        );
        harvests.abort_all();
    }

    let (queues, errors) = pipe.drain();

    let readings = queues
        .into_iter()
        .filter_map(|(metric, results)| {
            let values: Vec<f64> = results
                .iter()
                .filter(|r| completed.contains(&r.source))
                .map(|r| r.value)
                .collect();
            policy.reduce(&values).map(|value| (metric, value))
        })
        .collect();

    CycleOutcome {
        readings,
        errors,
        dispatched,
        timed_out,
    }
}
