use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::config::UnitVersions;
use crate::model::{RunId, RUN_DATE_FORMAT};

/// Length of the salt prefix embedded in artifact paths
pub const SHORT_SALT_LEN: usize = 6;

/// Version fingerprint of a unit and everything upstream of it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Salt(String);

impl Salt {
    /// blake3 over the sorted upstream salts, the task id, the unit version and
    /// the sorted `key=value` arguments
    pub fn derive(upstream: &[&Salt], task_id: &str, version: &str, args: &[(&str, &str)]) -> Self {
        let mut upstream: Vec<&str> = upstream.iter().map(|s| s.0.as_str()).collect();
        upstream.sort_unstable();
        let mut args: Vec<String> = args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        args.sort_unstable();

        // Every field is length-prefixed so adjacent fields cannot run together
        let mut hasher = blake3::Hasher::new();
        let fields = upstream
            .into_iter()
            .chain([task_id, version])
            .chain(args.iter().map(String::as_str));
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..SHORT_SALT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Salts of every unit in one run
///
/// Each salt chains the one upstream of it: collect -> partition -> worker_i.
/// An unsalted run uses plain artifact paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSalts {
    pub collect: Option<Salt>,
    pub partition: Option<Salt>,
    worker_version: Option<String>,
}

impl RunSalts {
    pub fn unsalted() -> Self {
        Self::default()
    }

    pub fn derive(run: &RunId, versions: &UnitVersions, capacity: usize, skip_header: bool) -> Self {
        let date = run.logical_date.format(RUN_DATE_FORMAT).to_string();
        let collect = Salt::derive(
            &[],
            "collect",
            &versions.producer,
            &[("pipeline", run.pipeline.as_str()), ("logical_date", date.as_str())],
        );
        let capacity = capacity.to_string();
        let skip_header = skip_header.to_string();
        let partition = Salt::derive(
            &[&collect],
            "partition",
            &versions.partition,
            &[("capacity", capacity.as_str()), ("skip_header", skip_header.as_str())],
        );
        Self {
            collect: Some(collect),
            partition: Some(partition),
            worker_version: Some(versions.worker.clone()),
        }
    }

    pub fn worker(&self, index: usize) -> Option<Salt> {
        let partition = self.partition.as_ref()?;
        let version = self.worker_version.as_deref()?;
        Some(Salt::derive(&[partition], &format!("worker_{}", index), version, &[]))
    }
}
