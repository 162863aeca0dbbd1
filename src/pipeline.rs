//! One moderation instance: every cache and index the stages share.
//!
//! Scanning, deciding and mutating run synchronously on `&mut self`. The only
//! suspension points are classification calls, which run as tasks in a
//! `JoinSet`, and store calls.

use crate::classifier::{ClassificationRequest, Classifier, InFlightGuard, InFlightSet};
use crate::config_loader::VeilConfig;
use crate::content_tree::{ContentTree, FeedNode, MutationBatch, NodeId};
use crate::decision::{Assessment, Decision, DecisionCache, Identity, Policy};
use crate::errors::{VeilError, VeilResult};
use crate::mutator::{ItemState, Mutator, ViewportEvent};
use crate::persistence::{ConcealmentRecord, PersistenceBridge, StoreChange, KEY_REMOVED_URLS};
use crate::scanner::{Item, ItemScanner};
use crate::watcher::{ChangeWatcher, Debounce};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, info_span, trace, warn};
use uuid::Uuid;

type Completion = (InFlightGuard, VeilResult<Assessment>);

/// Input from whatever hosts the content tree.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Append a subtree under the root.
    Append(FeedNode),
    AppendTo { parent: NodeId, node: FeedNode },
    Viewport(ViewportEvent),
    Reveal(NodeId),
}

/// Outcome of one pass over newly delivered content nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub discovered: usize,
    pub misses: usize,
    pub cache_hits: usize,
    pub requests: usize,
    pub coalesced: usize,
    pub provisional: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub passes: u64,
    pub requests: u64,
    pub fallbacks: u64,
    pub concealed: u64,
    pub released: u64,
}

pub struct ModerationPipeline {
    tree: ContentTree,
    mutations: mpsc::UnboundedReceiver<MutationBatch>,
    watcher: ChangeWatcher,
    scanner: ItemScanner,
    classifier: Arc<dyn Classifier>,
    metadata: serde_json::Map<String, serde_json::Value>,
    max_images: u32,
    cache: DecisionCache,
    in_flight: InFlightSet,
    mutator: Mutator,
    bridge: PersistenceBridge,
    changes: broadcast::Receiver<StoreChange>,
    record: ConcealmentRecord,
    policy: Policy,
    /// Display locations per identity for the pipeline's lifetime. Nodes that
    /// left the tree are pruned when their identity is reconciled.
    locations: HashMap<Identity, Vec<NodeId>>,
    identified: HashMap<NodeId, Identity>,
    tasks: JoinSet<Completion>,
    task_identities: HashMap<Id, Identity>,
    stats: PipelineStats,
}

impl ModerationPipeline {
    pub fn new(
        mut tree: ContentTree,
        config: &VeilConfig,
        classifier: Arc<dyn Classifier>,
        bridge: PersistenceBridge,
    ) -> Self {
        let mutations = tree.subscribe();
        let changes = bridge.subscribe();
        Self {
            tree,
            mutations,
            watcher: ChangeWatcher::from_config(&config.watcher),
            scanner: ItemScanner::from_config(&config.scanner),
            classifier,
            metadata: config.classifier.metadata.clone(),
            max_images: config.classifier.max_images,
            cache: DecisionCache::new(),
            in_flight: InFlightSet::new(),
            mutator: Mutator::new(&config.mutator),
            bridge,
            changes,
            record: ConcealmentRecord::new(),
            policy: config.policy,
            locations: HashMap::new(),
            identified: HashMap::new(),
            tasks: JoinSet::new(),
            task_identities: HashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Load stored state, then run a full pass over the current tree.
    pub async fn start(&mut self) -> VeilResult<PassReport> {
        self.policy = self.bridge.load_policy_and_record(&mut self.record).await?;
        info!(
            ai_threshold = self.policy.ai_threshold,
            misinfo_threshold = self.policy.misinfo_threshold,
            known = self.record.len(),
            classifier = self.classifier.name(),
            "pipeline started"
        );
        // Mutations from loading the tree are covered by the full pass.
        while self.mutations.try_recv().is_ok() {}
        let nodes = self.watcher.initial_nodes(&self.tree);
        self.ingest(&nodes)
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    pub fn tree(&self) -> &ContentTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ContentTree {
        &mut self.tree
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn record(&self) -> &ConcealmentRecord {
        &self.record
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn state_of(&self, node: NodeId) -> ItemState {
        self.mutator.state(node)
    }

    pub fn locations(&self, identity: &Identity) -> &[NodeId] {
        self.locations.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Resolve a mutation batch to content nodes and ingest them.
    pub fn process_batch(&mut self, batch: &MutationBatch) -> VeilResult<PassReport> {
        let nodes = self.watcher.content_nodes(&self.tree, batch);
        self.ingest(&nodes)
    }

    /// Scan, dedupe and dispatch delivered content nodes.
    pub fn ingest(&mut self, nodes: &[NodeId]) -> VeilResult<PassReport> {
        let mut report = PassReport {
            pass_id: Uuid::new_v4(),
            ..PassReport::default()
        };
        let span = info_span!("pass", pass_id = %report.pass_id);
        let _entered = span.enter();

        for &node in nodes {
            // An identified node may be concealed and no longer scannable.
            if let Some(identity) = self.identified.get(&node).cloned() {
                if let Some(decision) = self.cache.decide(&identity, &self.policy) {
                    report.cache_hits += 1;
                    self.apply(node, &decision)?;
                }
                continue;
            }

            let Some(item) = self.scanner.scan(&self.tree, node) else {
                trace!(node = node.index(), "no identity yet");
                report.misses += 1;
                continue;
            };
            ChangeWatcher::mark_processed(&mut self.tree, node)?;
            report.discovered += 1;
            self.identified.insert(node, item.identity.clone());

            let known = self.locations.entry(item.identity.clone()).or_default();
            if !known.contains(&node) {
                known.push(node);
            }

            if let Some(decision) = self.cache.decide(&item.identity, &self.policy) {
                report.cache_hits += 1;
                self.apply(node, &decision)?;
                continue;
            }

            if self.record.contains(&item.identity) && self.mutator.conceal(&mut self.tree, node, &item.identity)? {
                report.provisional += 1;
            }

            match self.in_flight.try_acquire(&item.identity)? {
                Some(guard) => {
                    self.dispatch(&item, guard);
                    report.requests += 1;
                }
                None => report.coalesced += 1,
            }
        }

        self.stats.passes += 1;
        if report.discovered > 0 || report.misses > 0 {
            debug!(
                discovered = report.discovered,
                misses = report.misses,
                cache_hits = report.cache_hits,
                requests = report.requests,
                coalesced = report.coalesced,
                provisional = report.provisional,
                "pass complete"
            );
        }
        Ok(report)
    }

    fn dispatch(&mut self, item: &Item, guard: InFlightGuard) {
        let classifier = Arc::clone(&self.classifier);
        let request = ClassificationRequest::from_item(item, &self.metadata, self.max_images);
        // The guard travels back with the result so the identity stays in
        // flight until the assessment is cached.
        let handle = self.tasks.spawn(async move {
            let result = classifier.classify(request).await;
            (guard, result)
        });
        self.task_identities.insert(handle.id(), item.identity.clone());
        self.stats.requests += 1;
    }

    /// Wait for the next classification to finish and apply it. Returns false
    /// when nothing is outstanding.
    pub async fn next_completion(&mut self) -> VeilResult<bool> {
        match self.tasks.join_next_with_id().await {
            Some(joined) => {
                self.on_joined(joined)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn on_joined(&mut self, joined: Result<(Id, Completion), JoinError>) -> VeilResult<()> {
        match joined {
            Ok((id, (guard, result))) => {
                self.task_identities.remove(&id);
                let identity = guard.identity().clone();
                self.complete(identity, result)?;
                drop(guard);
            }
            Err(err) => {
                let Some(identity) = self.task_identities.remove(&err.id()) else {
                    error!(error = %err, "classification task failed for an unknown identity");
                    return Ok(());
                };
                self.complete(identity, Err(VeilError::internal(err.to_string())))?;
            }
        }
        Ok(())
    }

    /// Cache the call's outcome (fail-open on any error) and apply the
    /// decision at every known location of the identity.
    pub fn complete(&mut self, identity: Identity, result: VeilResult<Assessment>) -> VeilResult<()> {
        let assessment = match result {
            Ok(assessment) => assessment,
            Err(e) => {
                if e.is_transport() {
                    warn!(identity = %identity.fingerprint(), error = %e, "classification unavailable, failing open");
                } else {
                    error!(identity = %identity.fingerprint(), error = %e, "classification task failed, failing open");
                }
                self.stats.fallbacks += 1;
                Assessment::fallback(identity.clone())
            }
        };
        debug!(
            identity = %identity.fingerprint(),
            ai_score = assessment.ai_score,
            misinfo_score = assessment.misinfo_score,
            source = ?assessment.source,
            "assessment cached"
        );
        self.cache.put(assessment);
        self.reconcile(&identity)
    }

    fn reconcile(&mut self, identity: &Identity) -> VeilResult<()> {
        let Some(decision) = self.cache.decide(identity, &self.policy) else {
            return Ok(());
        };
        let tree = &self.tree;
        let mut detached = Vec::new();
        let nodes = match self.locations.get_mut(identity) {
            Some(nodes) => {
                nodes.retain(|node| {
                    let attached = tree.is_attached(*node);
                    if !attached {
                        detached.push(*node);
                    }
                    attached
                });
                nodes.clone()
            }
            None => Vec::new(),
        };
        for node in detached {
            self.identified.remove(&node);
        }
        for node in nodes {
            self.apply(node, &decision)?;
        }
        Ok(())
    }

    fn apply(&mut self, node: NodeId, decision: &Decision) -> VeilResult<()> {
        if decision.should_conceal {
            // A user reveal holds until the next significant viewport event.
            if self.mutator.state(node) != ItemState::TemporarilyRevealed
                && self.mutator.conceal(&mut self.tree, node, &decision.identity)?
            {
                self.stats.concealed += 1;
            }
            self.record.insert(&decision.identity);
        } else if self.mutator.release(&mut self.tree, node)? {
            self.stats.released += 1;
        }
        Ok(())
    }

    /// Re-decide every known location from the cache. No classification calls.
    pub fn apply_policy(&mut self, policy: Policy) -> VeilResult<()> {
        self.policy = policy;
        let identities: Vec<Identity> = self.locations.keys().cloned().collect();
        for identity in &identities {
            self.reconcile(identity)?;
        }
        info!(
            ai_threshold = policy.ai_threshold,
            misinfo_threshold = policy.misinfo_threshold,
            "policy applied"
        );
        Ok(())
    }

    /// Persist a new policy and apply it immediately.
    pub async fn set_policy(&mut self, policy: Policy) -> VeilResult<()> {
        self.bridge.save_policy(&policy).await?;
        self.apply_policy(policy)
    }

    pub async fn reload_policy(&mut self) -> VeilResult<()> {
        let policy = self.bridge.load_policy().await?;
        if policy != self.policy {
            self.apply_policy(policy)?;
        }
        Ok(())
    }

    pub async fn on_store_change(&mut self, change: StoreChange) -> VeilResult<()> {
        if change.is_policy() {
            return self.reload_policy().await;
        }
        if change.key == KEY_REMOVED_URLS && change.value.is_none() {
            debug!("record cleared in store");
            self.record.reset();
        }
        Ok(())
    }

    pub fn reveal(&mut self, node: NodeId) -> VeilResult<bool> {
        self.mutator.reveal(&mut self.tree, node)
    }

    pub fn on_viewport(&mut self, event: ViewportEvent) -> VeilResult<usize> {
        let count = self.mutator.on_viewport(&mut self.tree, &event)?;
        if count > 0 {
            debug!(count, ?event, "re-concealed revealed items");
        }
        Ok(count)
    }

    /// Merge unsaved record changes into the store.
    pub async fn flush(&mut self) -> VeilResult<()> {
        if !self.record.has_unsaved() {
            return Ok(());
        }
        self.bridge.save_record(&mut self.record).await
    }

    /// Apply every outstanding classification, then flush.
    pub async fn drain(&mut self) -> VeilResult<()> {
        while self.next_completion().await? {}
        self.flush().await
    }

    fn handle_event(&mut self, event: HostEvent) -> VeilResult<()> {
        match event {
            HostEvent::Append(node) => {
                let root = self.tree.root();
                self.tree.append_snapshot(root, &node)?;
            }
            HostEvent::AppendTo { parent, node } => {
                self.tree.append_snapshot(parent, &node)?;
            }
            HostEvent::Viewport(event) => {
                self.on_viewport(event)?;
            }
            HostEvent::Reveal(node) => {
                self.reveal(node)?;
            }
        }
        Ok(())
    }

    /// Event loop. Runs until `events` closes, then finishes the pending pass,
    /// waits for outstanding classifications and flushes the record.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) -> VeilResult<()> {
        let mut debounce = Debounce::new(self.watcher.debounce());
        let mut events_open = true;
        let mut changes_open = true;

        loop {
            while let Ok(batch) = self.mutations.try_recv() {
                debounce.push(batch);
            }
            if !events_open && !debounce.is_pending() && self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(debounce.deadline()), if debounce.is_pending() => {
                    if let Some(batch) = debounce.take() {
                        self.process_batch(&batch)?;
                    }
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined)?;
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "record flush failed, will retry");
                    }
                }
                change = self.changes.recv(), if changes_open => match change {
                    Ok(change) => {
                        if let Err(e) = self.on_store_change(change).await {
                            warn!(error = %e, "applying store change failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "store changes lagged, reloading policy");
                        if let Err(e) = self.reload_policy().await {
                            warn!(error = %e, "policy reload failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            warn!(error = %e, "host event rejected");
                        }
                    }
                    None => events_open = false,
                },
            }
        }

        self.flush().await
    }
}
