use std::{
    any::Any,
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write as _},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::errors::ErrorList;

use super::{Metric, RecordSource, Source, Subject};

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Label identifying this run in the measurements file.
    pub run_label: String,
    pub output_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            run_label: String::new(),
            output_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("source for metric {0} already present")]
    Duplicate(String),
    #[error("failed to write measurements: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor shutdown failed:\n{0}")]
    Shutdown(ErrorList),
}

struct SourceEntry {
    records: Arc<dyn RecordSource>,
    typed: Box<dyn Any + Send + Sync>,
}

/// Directory of typed metric sources.
///
/// Sources are installed during setup and stopped on shutdown, at which point
/// all collected data is drained into `measurements.csv` under the output
/// directory. Typed access goes through [`Metric`] keys; the value shape is
/// recovered from a type-erased handle stored at install time.
pub struct Monitor {
    config: MonitorConfig,
    sources: Mutex<BTreeMap<&'static str, SourceEntry>>,
}

impl Monitor {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn measurements_path(&self) -> PathBuf {
        self.config.output_dir.join("measurements.csv")
    }

    /// Installs a source under its metric name. The monitor takes ownership
    /// of the source's lifecycle and will stop it on shutdown.
    pub fn install_source<S, V, T>(&self, source: Arc<T>) -> Result<(), MonitorError>
    where
        S: Subject,
        V: Clone + Send + Sync + 'static,
        T: Source<S, V> + 'static,
    {
        let name = source.metric_name();
        let typed: Arc<dyn Source<S, V>> = source.clone();
        let records: Arc<dyn RecordSource> = source;

        let mut sources = self.sources.lock().expect("monitor lock poisoned");
        if sources.contains_key(name) {
            return Err(MonitorError::Duplicate(name.to_owned()));
        }
        sources.insert(
            name,
            SourceEntry {
                records,
                typed: Box::new(typed),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn is_supported<S, V>(&self, metric: &Metric<S, V>) -> bool {
        self.sources
            .lock()
            .expect("monitor lock poisoned")
            .contains_key(metric.name)
    }

    /// Subjects with data for the given metric, in order.
    #[must_use]
    pub fn subjects<S, V>(&self, metric: &Metric<S, V>) -> Vec<S>
    where
        S: Subject,
        V: Clone + Send + Sync + 'static,
    {
        let mut subjects = self
            .with_typed(metric, |source| source.subjects())
            .unwrap_or_default();
        subjects.sort();
        subjects
    }

    /// Data collected for the metric and subject, or `None` when the metric
    /// has no source or the subject has no data.
    #[must_use]
    pub fn get_data<S, V>(&self, subject: &S, metric: &Metric<S, V>) -> Option<V>
    where
        S: Subject,
        V: Clone + Send + Sync + 'static,
    {
        self.with_typed(metric, |source| source.get_data(subject))
            .flatten()
    }

    fn with_typed<S, V, R>(
        &self,
        metric: &Metric<S, V>,
        f: impl FnOnce(&Arc<dyn Source<S, V>>) -> R,
    ) -> Option<R>
    where
        S: Subject,
        V: Clone + Send + Sync + 'static,
    {
        let sources = self.sources.lock().expect("monitor lock poisoned");
        let entry = sources.get(metric.name)?;
        let typed = entry.typed.downcast_ref::<Arc<dyn Source<S, V>>>()?;
        Some(f(typed))
    }

    /// Stops every source and drains all collected data to the measurements
    /// file. Source and IO failures are collected and joined so a single bad
    /// source cannot suppress the remaining data.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let entries: Vec<Arc<dyn RecordSource>> = {
            let sources = self.sources.lock().expect("monitor lock poisoned");
            sources.values().map(|e| Arc::clone(&e.records)).collect()
        };

        let mut failures = Vec::new();
        for source in &entries {
            if let Err(err) = source.shutdown().await {
                failures.push(format!(
                    "source {} shutdown failed: {err}",
                    source.metric_name()
                ));
            }
        }

        if let Err(err) = self.write_measurements(&entries) {
            failures.push(format!("measurement export failed: {err}"));
        }

        ErrorList::join(failures).map_err(MonitorError::Shutdown)
    }

    fn write_measurements(&self, entries: &[Arc<dyn RecordSource>]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let file = File::create(self.measurements_path())?;
        let mut out = BufWriter::new(file);
        writeln!(out, "run,metric,subject,position,value")?;

        let mut io_error = None;
        for source in entries {
            let metric = source.metric_name();
            source.for_each_record(&mut |record| {
                if io_error.is_some() {
                    return;
                }
                if let Err(err) = writeln!(
                    out,
                    "{},{},{},{},{}",
                    self.config.run_label, metric, record.subject, record.position, record.value
                ) {
                    io_error = Some(err);
                }
            });
        }
        if let Some(err) = io_error {
            return Err(err);
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{DynError, NodeTag, Record};

    struct FixedSource {
        name: &'static str,
        rows: Vec<(NodeTag, u64, u64)>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl RecordSource for FixedSource {
        fn metric_name(&self) -> &'static str {
            self.name
        }

        fn for_each_record(&self, consumer: &mut dyn FnMut(Record)) {
            for (subject, position, value) in &self.rows {
                consumer(Record::new(subject, position, value));
            }
        }

        async fn shutdown(&self) -> Result<(), DynError> {
            if self.fail_shutdown {
                Err("sensor read failed".into())
            } else {
                Ok(())
            }
        }
    }

    impl Source<NodeTag, u64> for FixedSource {
        fn subjects(&self) -> Vec<NodeTag> {
            self.rows.iter().map(|(s, _, _)| s.clone()).collect()
        }

        fn get_data(&self, subject: &NodeTag) -> Option<u64> {
            self.rows
                .iter()
                .find(|(s, _, _)| s == subject)
                .map(|(_, _, v)| *v)
        }
    }

    const HEIGHT: Metric<NodeTag, u64> = Metric::new("BlockHeight", "latest block height");

    fn monitor(dir: &std::path::Path) -> Monitor {
        Monitor::new(MonitorConfig {
            run_label: "test-run".to_owned(),
            output_dir: dir.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn duplicate_metric_installation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());

        let source = Arc::new(FixedSource {
            name: "BlockHeight",
            rows: vec![],
            fail_shutdown: false,
        });
        monitor.install_source(source.clone()).unwrap();

        let err = monitor.install_source(source).unwrap_err();
        assert!(matches!(err, MonitorError::Duplicate(name) if name == "BlockHeight"));
    }

    #[tokio::test]
    async fn typed_access_finds_installed_data() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());

        let source = Arc::new(FixedSource {
            name: "BlockHeight",
            rows: vec![
                (NodeTag("b".to_owned()), 1, 10),
                (NodeTag("a".to_owned()), 2, 20),
            ],
            fail_shutdown: false,
        });
        monitor.install_source(source).unwrap();

        assert!(monitor.is_supported(&HEIGHT));
        let subjects = monitor.subjects(&HEIGHT);
        assert_eq!(subjects[0].0, "a");
        assert_eq!(subjects[1].0, "b");
        assert_eq!(monitor.get_data(&NodeTag("a".to_owned()), &HEIGHT), Some(20));
        assert_eq!(monitor.get_data(&NodeTag("c".to_owned()), &HEIGHT), None);

        const OTHER: Metric<NodeTag, u64> = Metric::new("Missing", "not installed");
        assert!(monitor.get_data(&NodeTag("a".to_owned()), &OTHER).is_none());
    }

    #[tokio::test]
    async fn shutdown_writes_all_rows_and_joins_errors() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());

        monitor
            .install_source(Arc::new(FixedSource {
                name: "BlockHeight",
                rows: vec![(NodeTag("a".to_owned()), 7, 42)],
                fail_shutdown: true,
            }))
            .unwrap();

        let err = monitor.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("sensor read failed"));

        let csv = std::fs::read_to_string(monitor.measurements_path()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("run,metric,subject,position,value"));
        assert_eq!(lines.next(), Some("test-run,BlockHeight,a,7,42"));
    }
}
