use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    clock::{Clock, Time},
    errors::ErrorList,
    series::{Series, SyncedSeries},
};

use super::{DynError, Metric, Record, RecordSource, Source, Subject};

/// Default sampling period for periodic sources.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(10);

/// A pluggable probe producing one scalar reading per call.
#[async_trait]
pub trait Sensor<V>: Send + Sync {
    async fn read(&self) -> Result<V, DynError>;
}

/// Shared handle to a time-indexed series, the value shape of all periodic
/// metrics.
pub type TimeSeries<V> = Arc<dyn Series<Time, V>>;

struct SubjectState<V> {
    series: Arc<SyncedSeries<Time, V>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Samples a sensor per subject at a fixed period into a time series.
///
/// Each subject owns one sampling task; removing a subject cancels its task
/// but keeps the collected series available. Read failures are logged,
/// collected, and surfaced joined on shutdown.
pub struct PeriodicSource<S, V>
where
    S: Subject,
{
    metric: Metric<S, TimeSeries<V>>,
    clock: Arc<dyn Clock>,
    period: Duration,
    subjects: Mutex<BTreeMap<S, SubjectState<V>>>,
    read_errors: Arc<Mutex<Vec<String>>>,
}

impl<S, V> PeriodicSource<S, V>
where
    S: Subject,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(metric: Metric<S, TimeSeries<V>>, clock: Arc<dyn Clock>) -> Self {
        Self::with_period(metric, clock, DEFAULT_SAMPLE_PERIOD)
    }

    #[must_use]
    pub fn with_period(
        metric: Metric<S, TimeSeries<V>>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            metric,
            clock,
            period,
            subjects: Mutex::new(BTreeMap::new()),
            read_errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Starts sampling the sensor for a new subject.
    pub fn add_subject(
        &self,
        subject: S,
        sensor: Arc<dyn Sensor<V>>,
    ) -> Result<(), DynError> {
        let mut subjects = self.subjects.lock().expect("periodic source poisoned");
        if subjects.contains_key(&subject) {
            return Err(format!("subject {subject} is already sampled").into());
        }

        let series = Arc::new(SyncedSeries::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::sample_loop(
            subject.to_string(),
            sensor,
            Arc::clone(&series),
            Arc::clone(&self.clock),
            self.period,
            cancel.clone(),
            Arc::clone(&self.read_errors),
        ));

        subjects.insert(
            subject,
            SubjectState {
                series,
                cancel,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Stops sampling the subject; its series stays readable.
    pub async fn remove_subject(&self, subject: &S) -> Result<(), DynError> {
        let task = {
            let mut subjects = self.subjects.lock().expect("periodic source poisoned");
            let state = subjects
                .get_mut(subject)
                .ok_or_else(|| format!("subject {subject} is not sampled"))?;
            state.cancel.cancel();
            state.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    async fn sample_loop(
        label: String,
        sensor: Arc<dyn Sensor<V>>,
        series: Arc<SyncedSeries<Time, V>>,
        clock: Arc<dyn Clock>,
        period: Duration,
        cancel: CancellationToken,
        read_errors: Arc<Mutex<Vec<String>>>,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match sensor.read().await {
                Ok(value) => {
                    if let Err(err) = series.append(clock.now(), value) {
                        debug!(subject = %label, %err, "dropping out-of-order sample");
                    }
                }
                Err(err) => {
                    debug!(subject = %label, %err, "sensor read failed");
                    read_errors
                        .lock()
                        .expect("periodic source poisoned")
                        .push(format!("{label}: {err}"));
                }
            }
        }
    }
}

#[async_trait]
impl<S, V> RecordSource for PeriodicSource<S, V>
where
    S: Subject,
    V: Clone + fmt::Display + Send + Sync + 'static,
{
    fn metric_name(&self) -> &'static str {
        self.metric.name
    }

    fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
        let subjects = self.subjects.lock().expect("periodic source poisoned");
        for (subject, state) in subjects.iter() {
            for point in state.series.get_all() {
                consumer(Record::new(subject, point.position, point.value));
            }
        }
    }

    async fn shutdown(&self) -> Result<(), DynError> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut subjects = self.subjects.lock().expect("periodic source poisoned");
            subjects
                .values_mut()
                .filter_map(|state| {
                    state.cancel.cancel();
                    state.task.take()
                })
                .collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        let errors = std::mem::take(
            &mut *self.read_errors.lock().expect("periodic source poisoned"),
        );
        ErrorList::join(errors).map_err(|err| -> DynError { Box::new(err) })
    }
}

impl<S, V> Source<S, TimeSeries<V>> for PeriodicSource<S, V>
where
    S: Subject,
    V: Clone + fmt::Display + Send + Sync + 'static,
{
    fn subjects(&self) -> Vec<S> {
        self.subjects
            .lock()
            .expect("periodic source poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn get_data(&self, subject: &S) -> Option<TimeSeries<V>> {
        self.subjects
            .lock()
            .expect("periodic source poisoned")
            .get(subject)
            .map(|state| Arc::clone(&state.series) as TimeSeries<V>)
    }
}
