use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use squall_core::monitoring::{
    DynError, Metric, NodeTag,
    periodic::{Sensor, TimeSeries},
};
use url::Url;

pub const NODE_CPU_PROFILE: Metric<NodeTag, TimeSeries<u64>> = Metric::new(
    "NodeCpuProfile",
    "Size of the CPU profiles collected per node",
);

/// Sampling period for CPU profiles; they are heavier than scalar probes.
pub const PROFILE_PERIOD: Duration = Duration::from_secs(60);

const PROFILE_SECONDS: u32 = 1;

/// Fetches a short CPU profile from the node's pprof endpoint and stores it
/// under `cpu_profiles/<node>/NNNNNN.prof`. The recorded series carries the
/// profile sizes so gaps show up in the measurements.
pub struct CpuProfileSensor {
    url: Url,
    http: reqwest::Client,
    dir: PathBuf,
    next_index: AtomicU32,
}

impl CpuProfileSensor {
    pub fn new(node: &NodeTag, url: Url, output_dir: &std::path::Path) -> std::io::Result<Self> {
        let dir = output_dir.join("cpu_profiles").join(&node.0);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            url,
            http: reqwest::Client::new(),
            dir,
            next_index: AtomicU32::new(0),
        })
    }

    fn profile_url(&self) -> Url {
        let mut url = self.url.clone();
        url.set_query(Some(&format!("seconds={PROFILE_SECONDS}")));
        url
    }
}

#[async_trait]
impl Sensor<u64> for CpuProfileSensor {
    async fn read(&self) -> Result<u64, DynError> {
        let response = self
            .http
            .get(self.profile_url())
            .send()
            .await
            .map_err(|err| -> DynError { format!("profile fetch failed: {err}").into() })?
            .error_for_status()
            .map_err(|err| -> DynError { format!("profile fetch failed: {err}").into() })?;
        let body = response
            .bytes()
            .await
            .map_err(|err| -> DynError { format!("profile body unreadable: {err}").into() })?;

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{index:06}.prof"));
        tokio::fs::write(&path, &body)
            .await
            .map_err(|err| -> DynError { format!("cannot store profile: {err}").into() })?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_directory_is_created_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeTag("node-1".to_owned());
        let sensor = CpuProfileSensor::new(
            &node,
            Url::parse("http://localhost:6060/debug/pprof/profile").unwrap(),
            dir.path(),
        )
        .unwrap();

        assert!(dir.path().join("cpu_profiles/node-1").is_dir());
        assert!(sensor.profile_url().query().unwrap().contains("seconds="));
    }
}
