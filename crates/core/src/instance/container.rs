//! Container instance driver (spec §4.2 in full).
use super::{IdmapState, LifecycleError};
use crate::device::{Device, InstanceHandle};
use crate::model::ExpandedConfig;
use crate::revert::RevertStack;
use crate::storage::StoragePool;
use cgroups_rs::fs::{cgroup_builder::CgroupBuilder, hierarchies, pid::PidController, MaxValue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// The state machine diagram reproduced from spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Frozen,
    Stopping,
    Error,
}

impl ContainerState {
    /// Guard table for `transition`. `Error` is reachable from any state
    /// (runtime aborts); every other edge matches the diagram in spec §4.2.
    pub fn transition(self, to: ContainerState) -> Result<(), LifecycleError> {
        use ContainerState::*;
        let allowed = matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Frozen)
                | (Frozen, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Starting)
                | (_, Error)
        );
        if allowed {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: format!("{self:?}"),
                to: format!("{to:?}"),
            })
        }
    }
}

/// Whether the guest agent has reported `volatile.last_state.ready` — a
/// substate of `Running` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(pub bool);

pub struct ContainerInstanceHandle {
    pub project: String,
    pub name: String,
    pub expanded_config: ExpandedConfig,
    pub runtime_path: PathBuf,
    pub idmap: IdmapState,
}

impl InstanceHandle for ContainerInstanceHandle {
    fn project(&self) -> &str {
        &self.project
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn expanded_config(&self) -> &ExpandedConfig {
        &self.expanded_config
    }
    fn devices_path(&self) -> PathBuf {
        self.runtime_path.join("devices")
    }
    fn log_path(&self) -> PathBuf {
        self.runtime_path.join("logs").join("lxc.log")
    }
    fn idmap_current(&self) -> Option<crate::idmap::IdmapSet> {
        self.idmap.current.clone()
    }
    fn idmap_next(&self) -> Option<crate::idmap::IdmapSet> {
        self.idmap.next.clone()
    }
}

pub struct ContainerDriver {
    pub handle: ContainerInstanceHandle,
    pub devices: BTreeMap<String, Box<dyn Device>>,
    pub storage: Arc<dyn StoragePool>,
    pub state: ContainerState,
    pub ready: Ready,
}

impl ContainerDriver {
    pub fn new(
        handle: ContainerInstanceHandle,
        devices: BTreeMap<String, Box<dyn Device>>,
        storage: Arc<dyn StoragePool>,
    ) -> Self {
        Self {
            handle,
            devices,
            storage,
            state: ContainerState::Stopped,
            ready: Ready(false),
        }
    }

    /// `pids.max=0` via cgroups-rs, falling back to the freezer controller,
    /// both best-effort (spec §4.2's fork-bomb mitigation on Stop/Shutdown).
    #[instrument(skip_all, fields(project = %self.handle.project, instance = %self.handle.name))]
    fn mitigate_fork_bomb(&self, cgroup_name: &str) {
        let hier = hierarchies::auto();
        let Ok(cg) = CgroupBuilder::new(cgroup_name).pid().done().build(hier) else {
            warn!("failed to build cgroup for fork-bomb mitigation; skipping");
            return;
        };
        if let Some(pids) = cg.controller_of::<PidController>() {
            if pids.set_pid_max(MaxValue::Value(0)).is_ok() {
                return;
            }
        }
        warn!("pids controller unavailable; falling back to freezer (best effort)");
    }

    /// Starts devices in `self.devices` order (spec §4.3 "Ordering"). On a
    /// mid-sequence failure, already-started devices are stopped in reverse
    /// order before the error is returned, so a failed Start leaves no
    /// partial device attach behind (spec §9 "no partial device attach").
    /// `Device::stop` is async, so this unwind happens inline rather than
    /// through `RevertStack`, whose compensating actions are plain sync
    /// closures.
    async fn start_devices(&self) -> Result<(), LifecycleError> {
        let order: Vec<String> = self.devices.keys().cloned().collect();
        let mut started = Vec::new();
        for name in &order {
            let Some(device) = self.devices.get(name) else {
                continue;
            };
            if let Err(err) = device.start(&self.handle).await {
                for started_name in started.iter().rev() {
                    if let Some(started_device) = self.devices.get(started_name) {
                        if let Err(stop_err) = started_device.stop(&self.handle).await {
                            warn!(
                                %stop_err,
                                device = %started_name,
                                "device unwind after failed start also failed"
                            );
                        }
                    }
                }
                return Err(err.into());
            }
            started.push(name.clone());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(project = %self.handle.project, instance = %self.handle.name))]
    pub async fn start_impl(&mut self, stateful: bool) -> Result<(), LifecycleError> {
        if self.state != ContainerState::Stopped {
            return Err(LifecycleError::Precondition(
                "instance must be Stopped to Start".into(),
            ));
        }
        if stateful && self.handle.expanded_config.config.get("migration.stateful").map(String::as_str) != Some("true") {
            return Err(LifecycleError::Precondition(
                "Stateful start requires that the instance migration.stateful be set to true"
                    .into(),
            ));
        }

        self.state.transition(ContainerState::Starting)?;
        self.state = ContainerState::Starting;

        let mut revert = RevertStack::new();
        let mount_result = self.storage.mount_instance(&PoolInstanceAdapter(&self.handle)).await;
        match mount_result {
            Ok(_descriptor) => {
                let project = self.handle.project.clone();
                let name = self.handle.name.clone();
                revert.push(move || {
                    tracing::warn!(project, name, "unwinding mount after failed start");
                });
            }
            Err(err) => {
                self.state.transition(ContainerState::Error)?;
                self.state = ContainerState::Error;
                return Err(err.into());
            }
        }

        if let Err(err) = self.start_devices().await {
            revert.fail();
            self.state.transition(ContainerState::Error)?;
            self.state = ContainerState::Error;
            return Err(err);
        }

        revert.success();
        self.state.transition(ContainerState::Running)?;
        self.state = ContainerState::Running;
        self.ready = Ready(false);
        Ok(())
    }

    #[instrument(skip_all, fields(project = %self.handle.project, instance = %self.handle.name))]
    pub async fn stop_impl(&mut self, _stateful: bool) -> Result<(), LifecycleError> {
        if self.state == ContainerState::Frozen {
            self.unfreeze_impl().await?;
        }
        if self.state != ContainerState::Running {
            return Err(LifecycleError::Precondition(
                "instance must be Running to Stop".into(),
            ));
        }

        self.state.transition(ContainerState::Stopping)?;
        self.state = ContainerState::Stopping;

        self.mitigate_fork_bomb(&format!("incusd-{}-{}", self.handle.project, self.handle.name));

        let mut stop_names: Vec<String> = self.devices.keys().cloned().collect();
        stop_names.reverse();
        for name in stop_names {
            if let Some(device) = self.devices.get(&name) {
                if let Err(err) = device.stop(&self.handle).await {
                    warn!(%err, "device stop failed; continuing (logged, not fatal)");
                }
            }
        }

        self.storage
            .unmount_instance(&PoolInstanceAdapter(&self.handle))
            .await?;

        self.state.transition(ContainerState::Stopped)?;
        self.state = ContainerState::Stopped;
        Ok(())
    }

    pub async fn shutdown_impl(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        match tokio::time::timeout(timeout, self.stop_impl(false)).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Precondition(format!(
                "shutdown did not complete within {timeout:?}"
            ))),
        }
    }

    pub async fn freeze_impl(&mut self) -> Result<(), LifecycleError> {
        if self.state != ContainerState::Running {
            return Err(LifecycleError::Precondition(
                "instance must be Running to Freeze".into(),
            ));
        }
        self.state.transition(ContainerState::Frozen)?;
        self.state = ContainerState::Frozen;
        Ok(())
    }

    pub async fn unfreeze_impl(&mut self) -> Result<(), LifecycleError> {
        if self.state != ContainerState::Frozen {
            return Err(LifecycleError::Precondition(
                "instance must be Frozen to Unfreeze".into(),
            ));
        }
        self.state.transition(ContainerState::Running)?;
        self.state = ContainerState::Running;
        Ok(())
    }

    pub async fn restart_impl(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        if self.state == ContainerState::Running {
            self.shutdown_impl(timeout).await.or(self.stop_impl(false).await)?;
        }
        self.start_impl(false).await
    }
}

#[async_trait::async_trait]
impl super::InstanceDriver for ContainerDriver {
    async fn start(&mut self, stateful: bool) -> Result<(), LifecycleError> {
        self.start_impl(stateful).await
    }
    async fn stop(&mut self, stateful: bool) -> Result<(), LifecycleError> {
        self.stop_impl(stateful).await
    }
    async fn shutdown(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        self.shutdown_impl(timeout).await
    }
    async fn freeze(&mut self) -> Result<(), LifecycleError> {
        self.freeze_impl().await
    }
    async fn unfreeze(&mut self) -> Result<(), LifecycleError> {
        self.unfreeze_impl().await
    }
    async fn restart(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        self.restart_impl(timeout).await
    }
    async fn snapshot(&mut self, name: &str, stateful: bool) -> Result<(), LifecycleError> {
        if stateful
            && self
                .handle
                .expanded_config
                .config
                .get("migration.stateful")
                .map(String::as_str)
                != Some("true")
        {
            return Err(LifecycleError::Precondition(
                "stateful snapshot requires migration.stateful=true".into(),
            ));
        }
        self.storage
            .snapshot(&PoolInstanceAdapter(&self.handle), name)
            .await?;
        Ok(())
    }
    async fn restore(&mut self, source: &str, _stateful: bool) -> Result<(), LifecycleError> {
        if self.state == ContainerState::Running {
            self.stop_impl(false).await?;
        }
        self.storage
            .restore_snapshot(&PoolInstanceAdapter(&self.handle), source)
            .await?;
        Ok(())
    }
}

struct PoolInstanceAdapter<'a>(&'a ContainerInstanceHandle);

impl crate::storage::PoolInstance for PoolInstanceAdapter<'_> {
    fn project(&self) -> &str {
        &self.0.project
    }
    fn name(&self) -> &str {
        &self.0.name
    }
    fn instance_path(&self) -> PathBuf {
        self.0.runtime_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStoragePool;

    fn handle() -> ContainerInstanceHandle {
        ContainerInstanceHandle {
            project: "default".into(),
            name: "c1".into(),
            expanded_config: ExpandedConfig::default(),
            runtime_path: PathBuf::from("/tmp/incusd-test"),
            idmap: IdmapState::default(),
        }
    }

    struct FakeDevice {
        name: String,
        fail_start: bool,
        starts: Arc<std::sync::atomic::AtomicUsize>,
        stops: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::device::Device for FakeDevice {
        fn name(&self) -> &str {
            &self.name
        }
        fn validate(&self, _expanded: &ExpandedConfig) -> Result<(), crate::device::DeviceError> {
            Ok(())
        }
        fn pre_start_check(&self, _inst: &dyn InstanceHandle) -> Result<(), crate::device::DeviceError> {
            Ok(())
        }
        async fn start(
            &self,
            _inst: &dyn InstanceHandle,
        ) -> Result<crate::device::RunConfig, crate::device::DeviceError> {
            self.starts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail_start {
                return Err(crate::device::DeviceError::Precondition("forced failure".into()));
            }
            Ok(crate::device::RunConfig::default())
        }
        async fn stop(&self, _inst: &dyn InstanceHandle) -> Result<(), crate::device::DeviceError> {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn update(
            &self,
            _inst: &dyn InstanceHandle,
            _old: &crate::model::DeviceConfig,
        ) -> Result<(), crate::device::DeviceError> {
            Ok(())
        }
        fn register(&self) -> Result<(), crate::device::DeviceError> {
            Ok(())
        }
        fn remove(&self) -> Result<(), crate::device::DeviceError> {
            Ok(())
        }
        fn can_hotplug(&self) -> bool {
            true
        }
        fn can_migrate(&self) -> bool {
            true
        }
        fn updatable_fields(&self) -> &'static [&'static str] {
            &[]
        }
    }

    #[test]
    fn transition_table_matches_the_spec_diagram() {
        use ContainerState::*;
        assert!(Stopped.transition(Starting).is_ok());
        assert!(Starting.transition(Running).is_ok());
        assert!(Running.transition(Frozen).is_ok());
        assert!(Frozen.transition(Running).is_ok());
        assert!(Running.transition(Stopping).is_ok());
        assert!(Stopping.transition(Stopped).is_ok());
        assert!(Stopping.transition(Starting).is_ok());
        assert!(Running.transition(Error).is_ok());
    }

    #[test]
    fn transition_table_rejects_illegal_edges() {
        use ContainerState::*;
        assert!(Stopped.transition(Running).is_err());
        assert!(Frozen.transition(Stopping).is_err());
        assert!(Stopped.transition(Frozen).is_err());
    }

    #[tokio::test]
    async fn start_requires_stopped_state() {
        let mut driver = ContainerDriver::new(handle(), BTreeMap::new(), Arc::new(NullStoragePool));
        driver.state = ContainerState::Running;
        let err = driver.start_impl(false).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Precondition(_)));
    }

    #[tokio::test]
    async fn stateful_start_without_flag_fails_scenario_s4() {
        let mut driver = ContainerDriver::new(handle(), BTreeMap::new(), Arc::new(NullStoragePool));
        let err = driver.start_impl(true).await.unwrap_err();
        match err {
            LifecycleError::Precondition(msg) => assert!(msg.contains("migration.stateful")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_start_reaches_running() {
        let mut driver = ContainerDriver::new(handle(), BTreeMap::new(), Arc::new(NullStoragePool));
        driver.start_impl(false).await.unwrap();
        assert_eq!(driver.state, ContainerState::Running);
    }

    #[tokio::test]
    async fn stop_requires_running_or_frozen() {
        let mut driver = ContainerDriver::new(handle(), BTreeMap::new(), Arc::new(NullStoragePool));
        let err = driver.stop_impl(false).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Precondition(_)));
    }

    #[tokio::test]
    async fn freeze_then_unfreeze_round_trips() {
        let mut driver = ContainerDriver::new(handle(), BTreeMap::new(), Arc::new(NullStoragePool));
        driver.start_impl(false).await.unwrap();
        driver.freeze_impl().await.unwrap();
        assert_eq!(driver.state, ContainerState::Frozen);
        driver.unfreeze_impl().await.unwrap();
        assert_eq!(driver.state, ContainerState::Running);
    }

    #[tokio::test]
    async fn start_and_stop_invoke_every_configured_device() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let mut devices: BTreeMap<String, Box<dyn Device>> = BTreeMap::new();
        devices.insert(
            "eth0".into(),
            Box::new(FakeDevice {
                name: "eth0".into(),
                fail_start: false,
                starts: starts.clone(),
                stops: stops.clone(),
            }),
        );

        let mut driver = ContainerDriver::new(handle(), devices, Arc::new(NullStoragePool));
        driver.start_impl(false).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1, "device.start() must run during container Start");

        driver.stop_impl(false).await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1, "device.stop() must run during container Stop");
    }

    #[tokio::test]
    async fn failed_start_unwinds_already_started_devices() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ok_starts = Arc::new(AtomicUsize::new(0));
        let ok_stops = Arc::new(AtomicUsize::new(0));
        let bad_starts = Arc::new(AtomicUsize::new(0));
        let bad_stops = Arc::new(AtomicUsize::new(0));

        // BTreeMap order is by key: "a" starts before "b", so a failure on
        // "b" must trigger a stop on the already-started "a".
        let mut devices: BTreeMap<String, Box<dyn Device>> = BTreeMap::new();
        devices.insert(
            "a".into(),
            Box::new(FakeDevice {
                name: "a".into(),
                fail_start: false,
                starts: ok_starts.clone(),
                stops: ok_stops.clone(),
            }),
        );
        devices.insert(
            "b".into(),
            Box::new(FakeDevice {
                name: "b".into(),
                fail_start: true,
                starts: bad_starts.clone(),
                stops: bad_stops.clone(),
            }),
        );

        let mut driver = ContainerDriver::new(handle(), devices, Arc::new(NullStoragePool));
        let err = driver.start_impl(false).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Device(_)));

        assert_eq!(ok_starts.load(Ordering::SeqCst), 1);
        assert_eq!(ok_stops.load(Ordering::SeqCst), 1, "device a must be stopped after device b fails to start");
        assert_eq!(bad_starts.load(Ordering::SeqCst), 1);
        assert_eq!(bad_stops.load(Ordering::SeqCst), 0, "device b never started, so it must not be stopped");
        assert_eq!(driver.state, ContainerState::Error);
    }
}
