pub mod dispatch;
pub mod monitor;
pub mod periodic;

use std::{fmt, marker::PhantomData};

pub use monitor::{Monitor, MonitorConfig, MonitorError};

/// Boxed error used across monitoring sources, in the spirit of the scenario
/// runtime's dynamic errors.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Entities a metric can be indexed by.
pub trait Subject: fmt::Display + Clone + Ord + Send + Sync + 'static {}

impl<T> Subject for T where T: fmt::Display + Clone + Ord + Send + Sync + 'static {}

/// A monitored node, identified by its stable label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeTag(pub String);

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A monitored application, identified by its label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppTag(pub String);

impl fmt::Display for AppTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The network as a whole, for metrics with a single subject.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkTag;

impl fmt::Display for NetworkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("network")
    }
}

/// A typed metric key: the subject kind and value shape are carried in the
/// type, the name is what the monitor registry indexes by.
pub struct Metric<S, V> {
    pub name: &'static str,
    pub description: &'static str,
    _marker: PhantomData<fn() -> (S, V)>,
}

impl<S, V> Metric<S, V> {
    #[must_use]
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            _marker: PhantomData,
        }
    }
}

impl<S, V> Clone for Metric<S, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, V> Copy for Metric<S, V> {}

impl<S, V> fmt::Debug for Metric<S, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric").field("name", &self.name).finish()
    }
}

/// One row of persisted measurement data, before the run and metric columns
/// are attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub subject: String,
    pub position: String,
    pub value: String,
}

impl Record {
    pub fn new(
        subject: impl fmt::Display,
        position: impl fmt::Display,
        value: impl fmt::Display,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            position: position.to_string(),
            value: value.to_string(),
        }
    }
}

/// Type-erased source view the monitor uses for lifecycle and persistence.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    fn metric_name(&self) -> &'static str;

    /// Feeds every collected sample to the consumer, subject by subject.
    fn for_each_record(&self, consumer: &mut dyn FnMut(Record));

    /// Stops data collection; collection errors observed over the source's
    /// lifetime are surfaced here.
    async fn shutdown(&self) -> Result<(), DynError>;
}

/// A typed metric source: data per subject, plus the erased lifecycle view.
pub trait Source<S, V>: RecordSource
where
    S: Subject,
    V: Clone,
{
    /// Subjects with data, in order.
    fn subjects(&self) -> Vec<S>;

    fn get_data(&self, subject: &S) -> Option<V>;
}
