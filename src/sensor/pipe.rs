use crate::model::Metric;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One measurement from one sensor for one metric
#[derive(Clone, Debug, PartialEq)]
pub struct ReadingResult {
    pub source: String,
    pub value: f64,
}

/// Error reported by a sensor while harvesting
#[derive(Clone, Debug, PartialEq)]
pub struct HarvestError {
    pub source: String,
    pub metric: Option<Metric>,
    pub message: String,
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.metric {
            Some(metric) => write!(f, "sensor '{}' failed reading {}: {}", self.source, metric, self.message),
            None => write!(f, "sensor '{}' failed: {}", self.source, self.message),
        }
    }
}

impl std::error::Error for HarvestError {}

type Queues = HashMap<Metric, mpsc::UnboundedSender<ReadingResult>>;

/// Reading delivery surface for a single harvest cycle.
///
/// Holds one queue per requested metric. Sensors write through a
/// [`HarvestContext`]; the engine drains everything with [`ReadingsPipe::drain`]
/// once the cycle ends, after which the pipe is gone.
pub struct ReadingsPipe {
    senders: Arc<Queues>,
    receivers: HashMap<Metric, mpsc::UnboundedReceiver<ReadingResult>>,
    errors_tx: mpsc::UnboundedSender<HarvestError>,
    errors_rx: mpsc::UnboundedReceiver<HarvestError>,
}

impl ReadingsPipe {
    pub fn new(metrics: &[Metric]) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();

        for metric in metrics {
            if senders.contains_key(metric) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(metric.clone(), tx);
            receivers.insert(metric.clone(), rx);
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        Self {
            senders: Arc::new(senders),
            receivers,
            errors_tx,
            errors_rx,
        }
    }

    /// Producer view of the pipe for the sensor identified by `source`.
    pub fn context(&self, source: &str) -> HarvestContext {
        HarvestContext {
            source: source.to_string(),
            senders: Arc::clone(&self.senders),
            errors: self.errors_tx.clone(),
        }
    }

    /// Takes every result and error written so far.
    ///
    /// Writes arriving after this call are lost with the pipe.
    pub fn drain(mut self) -> (HashMap<Metric, Vec<ReadingResult>>, Vec<HarvestError>) {
        let mut results = HashMap::with_capacity(self.receivers.len());

        for (metric, rx) in self.receivers.iter_mut() {
            let mut queue = Vec::new();
            while let Ok(result) = rx.try_recv() {
                queue.push(result);
            }
            results.insert(metric.clone(), queue);
        }

        let mut errors = Vec::new();
        while let Ok(err) = self.errors_rx.try_recv() {
            errors.push(err);
        }

        (results, errors)
    }
}

/// Per-sensor write handle into a [`ReadingsPipe`]
#[derive(Clone)]
pub struct HarvestContext {
    source: String,
    senders: Arc<Queues>,
    errors: mpsc::UnboundedSender<HarvestError>,
}

impl HarvestContext {
    /// True if the current cycle requested `metric`.
    pub fn wants(&self, metric: &str) -> bool {
        self.senders.contains_key(&Metric::from(metric))
    }

    pub fn for_metric(&self, metric: &str) -> MetricWriter<'_> {
        MetricWriter {
            ctx: self,
            metric: Metric::from(metric),
        }
    }

    /// Reports an error not tied to a single metric.
    pub fn report_error(&self, message: impl fmt::Display) {
        let _ = self.errors.send(HarvestError {
            source: self.source.clone(),
            metric: None,
            message: message.to_string(),
        });
    }
}

/// Writes results for one metric
pub struct MetricWriter<'a> {
    ctx: &'a HarvestContext,
    metric: Metric,
}

impl MetricWriter<'_> {
    /// Writes a value. Ignored if the cycle did not request this metric;
    /// non-finite values are reported as errors instead.
    pub fn write(&self, value: f64) {
        if !value.is_finite() {
            self.write_error(format!("non-finite value {}", value));
            return;
        }

        if let Some(tx) = self.ctx.senders.get(&self.metric) {
            let _ = tx.send(ReadingResult {
                source: self.ctx.source.clone(),
                value,
            });
        }
    }

    pub fn write_error(&self, message: impl fmt::Display) {
        let _ = self.ctx.errors.send(HarvestError {
            source: self.ctx.source.clone(),
            metric: Some(self.metric.clone()),
            message: message.to_string(),
        });
    }

    pub fn write_with_error(&self, result: anyhow::Result<f64>) {
        match result {
            Ok(value) => self.write(value),
            Err(e) => self.write_error(format!("{:#}", e)),
        }
    }
}
