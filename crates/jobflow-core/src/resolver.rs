//! Skip / block / run decisions
//!
//! A job with no outputs is never skipped: there is nothing to judge
//! freshness against. A skippable job whose outputs are all fresh is
//! skipped. Anything else runs once every input is written and not being
//! edited.

use crate::task::TaskDescriptor;
use chrono::{DateTime, Utc};
use jobflow_artifact::{ArtifactId, ArtifactStore};
use std::collections::BTreeSet;

/// Resolver outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Dispatch now
    Run,
    /// Outputs are fresh; do not invoke the work unit
    Skip,
    /// Wait for inputs
    Block,
}

/// Stateless blocking resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingResolver;

impl BlockingResolver {
    /// Decide what to do with `task` given the current artifact state
    ///
    /// `force` bypasses the skip check only.
    pub fn decide(
        task: &TaskDescriptor,
        store: &dyn ArtifactStore,
        force: bool,
        now: DateTime<Utc>,
    ) -> Decision {
        let may_skip = task.is_skippable() && !force && !task.outputs().is_empty();
        if may_skip && Self::outputs_fresh(task, store, now) {
            return Decision::Skip;
        }

        if Self::inputs_ready(task, store) {
            Decision::Run
        } else {
            Decision::Block
        }
    }

    /// Every output written and within its validity period
    pub fn outputs_fresh(
        task: &TaskDescriptor,
        store: &dyn ArtifactStore,
        now: DateTime<Utc>,
    ) -> bool {
        task.outputs()
            .iter()
            .all(|output| output.is_fresh(&store.metadata(output), now))
    }

    /// Every input written and not being edited
    pub fn inputs_ready(task: &TaskDescriptor, store: &dyn ArtifactStore) -> bool {
        task.inputs().iter().all(|input| store.is_ready(input))
    }

    /// Artifacts still holding the job back
    ///
    /// Inputs that are unwritten or being edited, plus outputs locked by an
    /// editor other than `editor`.
    pub fn waiting_on(
        task: &TaskDescriptor,
        store: &dyn ArtifactStore,
        editor: &str,
    ) -> BTreeSet<ArtifactId> {
        let inputs = task
            .inputs()
            .iter()
            .filter(|input| !store.is_ready(input));

        let outputs = task.outputs().iter().filter(|output| {
            store
                .metadata(output)
                .editor
                .is_some_and(|holder| holder != editor)
        });

        inputs.chain(outputs).map(|a| a.id().clone()).collect()
    }
}
