use std::collections::BTreeMap;

use super::ArtifactKey;
use crate::model::RunId;
use crate::unit::salt::{RunSalts, Salt};

/// Deterministic artifact locations for one run
///
/// Every key is a pure function of the run identity, the unit index and the
/// optional unit salt, so a consumer never has to list storage to find its
/// inputs.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    run: RunId,
}

fn suffixed(base: &str, salt: Option<&Salt>) -> String {
    match salt {
        Some(salt) => format!("{}-{}", base, salt.short()),
        None => base.to_string(),
    }
}

impl ArtifactLayout {
    pub fn new(run: RunId) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    /// `{run}/collect[-salt]/batch.json`
    pub fn batch_key(&self, salt: Option<&Salt>) -> ArtifactKey {
        ArtifactKey::new(format!(
            "{}/{}/batch.json",
            self.run.path_prefix(),
            suffixed("collect", salt)
        ))
    }

    /// Directory holding the partition outputs, `{run}/to_do[-salt]`
    pub fn partition_dir(&self, salt: Option<&Salt>) -> String {
        format!("{}/{}", self.run.path_prefix(), suffixed("to_do", salt))
    }

    /// `{run}/to_do[-salt]/todo_{index}.json`
    pub fn chunk_key(&self, index: usize, salt: Option<&Salt>) -> ArtifactKey {
        ArtifactKey::new(format!("{}/todo_{}.json", self.partition_dir(salt), index))
    }

    /// Completion marker of the partition unit, written after every chunk
    pub fn manifest_key(&self, salt: Option<&Salt>) -> ArtifactKey {
        ArtifactKey::new(format!("{}/_manifest.json", self.partition_dir(salt)))
    }

    /// `{run}/worker_{index}/cases[-salt].json`
    pub fn worker_key(&self, index: usize, salt: Option<&Salt>) -> ArtifactKey {
        ArtifactKey::new(format!(
            "{}/worker_{}/{}.json",
            self.run.path_prefix(),
            index,
            suffixed("cases", salt)
        ))
    }

    /// Name to key map of a partition output with `task_count` chunks
    pub fn requires_partition(&self, task_count: usize, salt: Option<&Salt>) -> BTreeMap<String, ArtifactKey> {
        (0..task_count)
            .map(|i| (format!("todo_{}", i), self.chunk_key(i, salt)))
            .collect()
    }

    /// Keys of every worker output, in index order
    pub fn worker_keys(&self, task_count: usize, salts: &RunSalts) -> Vec<ArtifactKey> {
        (0..task_count)
            .map(|i| self.worker_key(i, salts.worker(i).as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn layout() -> ArtifactLayout {
        ArtifactLayout::new(RunId::new(
            "jail_scraper",
            NaiveDate::from_ymd_opt(2020, 4, 30).unwrap(),
        ))
    }

    #[test]
    fn test_unsalted_keys() {
        let layout = layout();
        assert_eq!(
            layout.batch_key(None).as_str(),
            "jail_scraper/04-30-2020/collect/batch.json"
        );
        assert_eq!(
            layout.chunk_key(2, None).as_str(),
            "jail_scraper/04-30-2020/to_do/todo_2.json"
        );
        assert_eq!(
            layout.manifest_key(None).as_str(),
            "jail_scraper/04-30-2020/to_do/_manifest.json"
        );
        assert_eq!(
            layout.worker_key(0, None).as_str(),
            "jail_scraper/04-30-2020/worker_0/cases.json"
        );
    }

    #[test]
    fn test_salted_keys_embed_short_salt() {
        let layout = layout();
        let salt = Salt::derive(&[], "partition", "0.1.0", &[]);
        let key = layout.chunk_key(1, Some(&salt));
        assert_eq!(
            key.as_str(),
            format!("jail_scraper/04-30-2020/to_do-{}/todo_1.json", salt.short())
        );
        assert_eq!(salt.short().len(), 6);
    }

    #[test]
    fn test_requires_partition() {
        let layout = layout();
        let map = layout.requires_partition(3, None);
        assert_eq!(map.len(), 3);
        assert_eq!(map["todo_0"], layout.chunk_key(0, None));
        assert_eq!(map["todo_2"], layout.chunk_key(2, None));
        assert!(layout.requires_partition(0, None).is_empty());
    }

    #[test]
    fn test_worker_keys_follow_index_order() {
        let layout = layout();
        let keys = layout.worker_keys(3, &RunSalts::unsalted());
        assert_eq!(
            keys,
            vec![
                layout.worker_key(0, None),
                layout.worker_key(1, None),
                layout.worker_key(2, None)
            ]
        );

        let salts = RunSalts::derive(layout.run(), &Default::default(), 3, false);
        let salted = layout.worker_keys(2, &salts);
        assert_eq!(salted[1], layout.worker_key(1, salts.worker(1).as_ref()));
        assert_ne!(salted[1], keys[1]);
    }
}
