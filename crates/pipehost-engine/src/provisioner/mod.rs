//! Mount lifecycle and provisioning of cluster runs
//!
//! The [`Provisioner`] is the host's context object. It owns every module and
//! cluster wrapper, decides whether a run may start, creates and registers
//! the run's [`Supervisor`], and handles the completion report once the run
//! has drained.
//!
//! Stream clusters are never provisioned on request. They start when both the
//! cluster and its module are mounted and stop (by suspension) when either is
//! unmounted.

mod wrapper;

pub use wrapper::{ClusterInfo, ClusterWrapper, ModuleInfo, ModuleWrapper};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::ProvisionError;
use crate::pipeline::{
    Cluster, CompletionReport, Item, OnCrash, RunConfig, Supervisor, SupervisorStatus,
};
use crate::subsystems::{DatabaseHandle, Messenger, Severity};
use wrapper::Flags;

/// Completion reports buffered for slow subscribers
const COMPLETION_BACKLOG: usize = 64;

/// Who is asking for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    /// Control plane or any other outside request
    External,
    /// The mount lifecycle itself
    Lifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// Live runs remain; removal happens once they report completion
    MarkedForDeletion,
}

pub struct Provisioner {
    modules: RwLock<HashMap<String, Arc<ModuleWrapper>>>,
    database: DatabaseHandle,
    messenger: Arc<dyn Messenger>,
    completions: broadcast::Sender<CompletionReport>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("modules", &self.read_modules().len())
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(database: DatabaseHandle, messenger: Arc<dyn Messenger>) -> Arc<Self> {
        let (completions, _) = broadcast::channel(COMPLETION_BACKLOG);
        Arc::new(Self {
            modules: RwLock::new(HashMap::new()),
            database,
            messenger,
            completions,
        })
    }

    pub fn database(&self) -> &DatabaseHandle {
        &self.database
    }

    /// Receive every completion report produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionReport> {
        self.completions.subscribe()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_module(
        &self,
        identifier: &str,
        clusters: Vec<(String, Arc<dyn Cluster>)>,
    ) -> Result<(), ProvisionError> {
        let module = ModuleWrapper::new(identifier);
        for (cluster, implementation) in clusters {
            if !module.insert(ClusterWrapper::new(cluster.clone(), implementation)) {
                return Err(ProvisionError::DuplicateCluster {
                    module: identifier.to_string(),
                    cluster,
                });
            }
        }

        let mut modules = self.write_modules();
        if modules.contains_key(identifier) {
            return Err(ProvisionError::DuplicateModule(identifier.to_string()));
        }
        modules.insert(identifier.to_string(), Arc::new(module));

        info!(module = %identifier, "Registered module");
        Ok(())
    }

    pub fn register_cluster(
        &self,
        module: &str,
        identifier: &str,
        cluster: Arc<dyn Cluster>,
    ) -> Result<(), ProvisionError> {
        let wrapper = self.module(module)?;
        if wrapper.is_marked_for_deletion() {
            return Err(ProvisionError::MarkedForDeletion(module.to_string()));
        }
        if !wrapper.insert(ClusterWrapper::new(identifier, cluster)) {
            return Err(ProvisionError::DuplicateCluster {
                module: module.to_string(),
                cluster: identifier.to_string(),
            });
        }

        info!(module = %module, cluster = %identifier, "Registered cluster");
        Ok(())
    }

    /// Validate and store a run config for `module`
    pub async fn put_config(&self, module: &str, config: RunConfig) -> Result<(), ProvisionError> {
        self.module(module)?;
        config.validate()?;
        self.database.put_config(module, config).await?;
        Ok(())
    }

    // ========================================================================
    // Mount lifecycle
    // ========================================================================

    /// Mount a module, starting its mounted stream clusters
    ///
    /// Returns the ids of stream supervisors started by this call.
    pub async fn mount_module(self: &Arc<Self>, module: &str) -> Result<Vec<u32>, ProvisionError> {
        let wrapper = self.module(module)?;
        {
            let mut flags = wrapper.flags.write();
            if flags.marked_for_deletion {
                return Err(ProvisionError::MarkedForDeletion(module.to_string()));
            }
            if !flags.mounted {
                flags.mounted = true;
                info!(module = %module, "Module mounted");
            }
        }

        let mut started = Vec::new();
        for cluster in wrapper.clusters() {
            if cluster.is_mounted() {
                if let Some(id) = self.start_stream(&wrapper, &cluster).await {
                    started.push(id);
                }
            }
        }
        Ok(started)
    }

    /// Mount one cluster; a stream cluster starts if its module is mounted
    pub async fn mount_cluster(
        self: &Arc<Self>,
        module: &str,
        cluster: &str,
    ) -> Result<Option<u32>, ProvisionError> {
        let (module_wrapper, cluster_wrapper) = self.resolve(module, cluster)?;
        if module_wrapper.is_marked_for_deletion() {
            return Err(ProvisionError::MarkedForDeletion(module.to_string()));
        }
        {
            let mut flags = cluster_wrapper.flags.write();
            if flags.marked_for_deletion {
                return Err(ProvisionError::MarkedForDeletion(format!("{module}/{cluster}")));
            }
            if !flags.mounted {
                flags.mounted = true;
                info!(module = %module, cluster = %cluster, "Cluster mounted");
            }
        }

        if !module_wrapper.is_mounted() {
            return Ok(None);
        }
        Ok(self.start_stream(&module_wrapper, &cluster_wrapper).await)
    }

    /// Unmount a module, suspending its live stream runs
    ///
    /// Returns how many runs were suspended.
    pub fn unmount_module(&self, module: &str) -> Result<usize, ProvisionError> {
        let wrapper = self.module(module)?;
        if wrapper.flags.set_mounted(false) {
            info!(module = %module, "Module unmounted");
        }
        Ok(wrapper.clusters().iter().map(|c| c.suspend_streams()).sum())
    }

    pub fn unmount_cluster(&self, module: &str, cluster: &str) -> Result<usize, ProvisionError> {
        let (_, wrapper) = self.resolve(module, cluster)?;
        if wrapper.flags.set_mounted(false) {
            info!(module = %module, cluster = %cluster, "Cluster unmounted");
        }
        Ok(wrapper.suspend_streams())
    }

    async fn start_stream(
        self: &Arc<Self>,
        module: &Arc<ModuleWrapper>,
        cluster: &Arc<ClusterWrapper>,
    ) -> Option<u32> {
        let config = match self
            .database
            .get_config(module.identifier(), cluster.identifier())
            .await
        {
            Ok(Some(config)) if config.is_stream() => config,
            Ok(_) => return None,
            Err(e) => {
                warn!(
                    module = %module.identifier(),
                    cluster = %cluster.identifier(),
                    error = %e,
                    "Could not resolve run config while mounting"
                );
                return None;
            }
        };

        let launched = config
            .validate()
            .and_then(|_| self.launch(module, cluster, config, Item::Null));
        match launched {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    module = %module.identifier(),
                    cluster = %cluster.identifier(),
                    error = %e,
                    "Stream cluster not started"
                );
                None
            }
        }
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Start a run and return its supervisor id without waiting for it
    ///
    /// `config_name` defaults to the cluster identifier. `metadata` is carried
    /// into the completion report untouched.
    pub async fn provision(
        self: &Arc<Self>,
        module: &str,
        cluster: &str,
        metadata: Item,
        config_name: Option<&str>,
        caller: Caller,
    ) -> Result<u32, ProvisionError> {
        let (module_wrapper, cluster_wrapper) = self.resolve(module, cluster)?;
        admit(
            &module_wrapper.flags.get(),
            &cluster_wrapper.flags.get(),
            module,
            cluster,
        )?;

        let name = config_name.unwrap_or(cluster);
        let config = self
            .database
            .get_config(module, name)
            .await?
            .ok_or_else(|| ProvisionError::ConfigNotFound {
                module: module.to_string(),
                config: name.to_string(),
            })?;
        config.validate()?;

        if config.is_stream() && caller == Caller::External {
            return Err(ProvisionError::StreamNotProvisionable(cluster.to_string()));
        }

        self.launch(&module_wrapper, &cluster_wrapper, config, metadata)
    }

    /// Register a supervisor for the run and spawn it
    ///
    /// The mount flags are re-checked while the registration happens, so a
    /// concurrent delete either sees the new supervisor or rejects it.
    fn launch(
        self: &Arc<Self>,
        module: &Arc<ModuleWrapper>,
        cluster: &Arc<ClusterWrapper>,
        config: RunConfig,
        metadata: Item,
    ) -> Result<u32, ProvisionError> {
        let stream = config.is_stream();
        let supervisor = Arc::new(Supervisor::new(
            module.identifier(),
            cluster.identifier(),
            cluster.cluster(),
            config,
            metadata,
            Arc::clone(&self.messenger),
        ));

        let id = {
            let module_flags = module.flags.read();
            let cluster_flags = cluster.flags.read();
            admit(&module_flags, &cluster_flags, module.identifier(), cluster.identifier())?;

            if stream {
                match cluster.registry().register_exclusive(Arc::clone(&supervisor)) {
                    Ok(id) => id,
                    Err(live) => {
                        debug!(
                            cluster = %cluster.identifier(),
                            supervisor_id = live,
                            "Stream already running"
                        );
                        return Ok(live);
                    }
                }
            } else {
                cluster.registry().register(Arc::clone(&supervisor))
            }
        };

        info!(
            module = %module.identifier(),
            cluster = %cluster.identifier(),
            supervisor_id = id,
            stream,
            "Provisioned run"
        );

        let this = Arc::clone(self);
        let module = Arc::clone(module);
        let cluster = Arc::clone(cluster);
        tokio::spawn(async move {
            match supervisor.start().await {
                Ok(report) => this.complete(&cluster, report).await,
                Err(e) => {
                    error!(
                        cluster = %cluster.identifier(),
                        supervisor_id = id,
                        error = %e,
                        "Run did not start"
                    );
                    cluster.registry().unregister(id);
                    this.retry_deletions();
                }
            }
            debug!(module = %module.identifier(), supervisor_id = id, "Run task finished");
        });

        Ok(id)
    }

    async fn complete(&self, cluster: &ClusterWrapper, report: CompletionReport) {
        let stats = &report.statistics;
        let summary = format!(
            "run {} {} in {:.3}s: {} extracted, {} loaded, {} filtered, {} dropped, workers {}/{}/{}",
            report.supervisor_id,
            if report.crashed { "crashed" } else { "finished" },
            report.elapsed.as_secs_f64(),
            stats.items_extracted,
            stats.items_loaded,
            stats.items_filtered,
            stats.items_dropped,
            stats.extract_workers,
            stats.transform_workers,
            stats.load_workers,
        );
        let severity = if report.crashed {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.messenger.send(cluster.identifier(), severity, &summary);
        self.messenger.close(cluster.identifier());

        if let Err(e) = self.database.record_report(report.clone()).await {
            warn!(
                cluster = %cluster.identifier(),
                supervisor_id = report.supervisor_id,
                error = %e,
                "Failed to record completion report"
            );
        }

        cluster.registry().unregister(report.supervisor_id);

        if report.crashed
            && report.config.on_crash == OnCrash::Unmount
            && cluster.flags.set_mounted(false)
        {
            warn!(
                module = %report.module,
                cluster = %cluster.identifier(),
                "Cluster unmounted after crashed run"
            );
        }

        self.retry_deletions();

        // No subscribers is fine.
        let _ = self.completions.send(report);
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Mark a module for deletion and remove it once no run is live
    pub fn delete_module(&self, module: &str) -> Result<DeleteOutcome, ProvisionError> {
        let wrapper = self.module(module)?;
        {
            let mut flags = wrapper.flags.write();
            flags.marked_for_deletion = true;
            flags.mounted = false;
        }
        for cluster in wrapper.clusters() {
            cluster.suspend_streams();
        }

        let mut modules = self.write_modules();
        if wrapper.is_idle() {
            modules.remove(module);
            info!(module = %module, "Deleted module");
            Ok(DeleteOutcome::Deleted)
        } else {
            info!(module = %module, "Module has live runs; marked for deletion");
            Ok(DeleteOutcome::MarkedForDeletion)
        }
    }

    /// Mark a cluster for deletion and remove it once no run is live
    pub fn delete_cluster(
        &self,
        module: &str,
        cluster: &str,
    ) -> Result<DeleteOutcome, ProvisionError> {
        let (module_wrapper, cluster_wrapper) = self.resolve(module, cluster)?;
        {
            let mut flags = cluster_wrapper.flags.write();
            flags.marked_for_deletion = true;
            flags.mounted = false;
        }
        cluster_wrapper.suspend_streams();

        if module_wrapper.remove_if_idle(cluster) {
            info!(module = %module, cluster = %cluster, "Deleted cluster");
            Ok(DeleteOutcome::Deleted)
        } else {
            info!(
                module = %module,
                cluster = %cluster,
                "Cluster has live runs; marked for deletion"
            );
            Ok(DeleteOutcome::MarkedForDeletion)
        }
    }

    /// Remove every marked module or cluster that has gone idle
    fn retry_deletions(&self) {
        let mut modules = self.write_modules();
        modules.retain(|identifier, module| {
            for cluster in module.purge_marked() {
                info!(module = %identifier, cluster = %cluster, "Deleted cluster");
            }
            if module.is_marked_for_deletion() && module.is_idle() {
                info!(module = %identifier, "Deleted module");
                return false;
            }
            true
        });
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn status(
        &self,
        module: &str,
        cluster: &str,
    ) -> Result<Vec<SupervisorStatus>, ProvisionError> {
        let (_, wrapper) = self.resolve(module, cluster)?;
        Ok(wrapper.registry().statuses())
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<ModuleInfo> = self.read_modules().values().map(|m| m.info()).collect();
        modules.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        modules
    }

    pub async fn reports(
        &self,
        module: &str,
        cluster: &str,
    ) -> Result<Vec<CompletionReport>, ProvisionError> {
        Ok(self.database.reports(module, cluster).await?)
    }

    fn module(&self, module: &str) -> Result<Arc<ModuleWrapper>, ProvisionError> {
        self.read_modules()
            .get(module)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownModule(module.to_string()))
    }

    fn resolve(
        &self,
        module: &str,
        cluster: &str,
    ) -> Result<(Arc<ModuleWrapper>, Arc<ClusterWrapper>), ProvisionError> {
        let module_wrapper = self.module(module)?;
        let cluster_wrapper =
            module_wrapper
                .cluster(cluster)
                .ok_or_else(|| ProvisionError::UnknownCluster {
                    module: module.to_string(),
                    cluster: cluster.to_string(),
                })?;
        Ok((module_wrapper, cluster_wrapper))
    }

    fn read_modules(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ModuleWrapper>>> {
        self.modules.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_modules(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ModuleWrapper>>> {
        self.modules.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn admit(
    module_flags: &Flags,
    cluster_flags: &Flags,
    module: &str,
    cluster: &str,
) -> Result<(), ProvisionError> {
    if module_flags.marked_for_deletion {
        return Err(ProvisionError::MarkedForDeletion(module.to_string()));
    }
    if cluster_flags.marked_for_deletion {
        return Err(ProvisionError::MarkedForDeletion(format!("{module}/{cluster}")));
    }
    if !module_flags.mounted {
        return Err(ProvisionError::ModuleNotMounted(module.to_string()));
    }
    if !cluster_flags.mounted {
        return Err(ProvisionError::ClusterNotMounted {
            module: module.to_string(),
            cluster: cluster.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::ExtractSink;
    use crate::subsystems::{InMemoryDatabase, MemoryMessenger};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Passthrough;

    #[async_trait]
    impl Cluster for Passthrough {
        async fn extract(&self, sink: ExtractSink) -> anyhow::Result<()> {
            sink.push(serde_json::json!("one")).await?;
            Ok(())
        }

        async fn transform(&self, item: Item) -> anyhow::Result<Option<Item>> {
            Ok(Some(item))
        }

        async fn load(&self, _item: Item) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn provisioner() -> (Arc<Provisioner>, Arc<MemoryMessenger>) {
        let (db, _) =
            DatabaseHandle::spawn_with(InMemoryDatabase::new(8), 16, Duration::from_secs(2));
        let messenger = Arc::new(MemoryMessenger::default());
        let provisioner = Provisioner::new(db, messenger.clone());
        provisioner
            .register_module(
                "m",
                vec![("c".to_string(), Arc::new(Passthrough) as Arc<dyn Cluster>)],
            )
            .unwrap();
        (provisioner, messenger)
    }

    #[test]
    fn test_admit_checks_deletion_before_mount() {
        let mounted = Flags {
            mounted: true,
            marked_for_deletion: false,
        };
        let marked = Flags {
            mounted: false,
            marked_for_deletion: true,
        };
        assert!(admit(&mounted, &mounted, "m", "c").is_ok());
        assert_eq!(
            admit(&marked, &mounted, "m", "c"),
            Err(ProvisionError::MarkedForDeletion("m".to_string()))
        );
        assert_eq!(
            admit(&mounted, &Flags::default(), "m", "c"),
            Err(ProvisionError::ClusterNotMounted {
                module: "m".to_string(),
                cluster: "c".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (provisioner, _) = provisioner();
        let err = provisioner.register_module("m", Vec::new()).unwrap_err();
        assert_eq!(err, ProvisionError::DuplicateModule("m".to_string()));

        let err = provisioner
            .register_cluster("m", "c", Arc::new(Passthrough))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DuplicateCluster { .. }));
    }

    #[tokio::test]
    async fn test_completion_reports_to_messenger_and_database() {
        let (provisioner, messenger) = provisioner();
        provisioner.put_config("m", RunConfig::new("c")).await.unwrap();
        provisioner.mount_module("m").await.unwrap();
        provisioner.mount_cluster("m", "c").await.unwrap();

        let mut reports = provisioner.subscribe();
        let id = provisioner
            .provision("m", "c", serde_json::json!({"run": 1}), None, Caller::External)
            .await
            .unwrap();
        let report = reports.recv().await.unwrap();

        assert_eq!(report.supervisor_id, id);
        assert_eq!(report.metadata, serde_json::json!({"run": 1}));
        assert_eq!(report.statistics.items_loaded, 1);
        assert!(provisioner.status("m", "c").unwrap().is_empty());

        let stored = provisioner.reports("m", "c").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(messenger.closed(), vec!["c".to_string()]);
        assert!(messenger
            .lines_for("c")
            .iter()
            .any(|l| l.line.contains("finished")));
    }
}
