use tracing::{info, warn};

use crate::network::Mutation;

/// Persistence boundary. Every commit is one transactional unit; a run that
/// aborts must not keep anything it committed.
pub trait PartitionSink {
    fn commit_partition(&mut self, label: &str, mutations: Vec<Mutation>) -> anyhow::Result<()>;

    fn abort_run(&mut self, reason: &str) -> anyhow::Result<()>;
}

/// Keeps every commit in memory. Aborting drops what was committed so far.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub commits: Vec<(String, Vec<Mutation>)>,
    pub aborted: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.commits.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn total_mutations(&self) -> usize {
        self.commits.iter().map(|(_, m)| m.len()).sum()
    }

    pub fn mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.commits.iter().flat_map(|(_, m)| m.iter())
    }
}

impl PartitionSink for RecordingSink {
    fn commit_partition(&mut self, label: &str, mutations: Vec<Mutation>) -> anyhow::Result<()> {
        info!(partition = label, mutations = mutations.len(), "committed");
        self.commits.push((label.to_string(), mutations));
        Ok(())
    }

    fn abort_run(&mut self, reason: &str) -> anyhow::Result<()> {
        warn!(reason, discarded = self.commits.len(), "run aborted, discarding commits");
        self.commits.clear();
        self.aborted = Some(reason.to_string());
        Ok(())
    }
}
