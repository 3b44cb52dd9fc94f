use crate::api::ApiError;
use crate::dto::{
    ActionType, Balloon, BootSource, Drive, InstanceActionInfo, InstanceInfo, InstanceState,
    MachineConfiguration, NetworkInterface, Pmem, VmState, Vsock,
};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::time::{Duration, timeout};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn vmm process: {0}")]
    Process(#[from] std::io::Error),

    #[error("cannot connect control socket")]
    CannotConnectApiSocket,

    #[error("control api error: {0}")]
    Api(#[from] ApiError),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Default, Clone)]
struct RuntimeConfig {
    boot_source: Option<BootSource>,
    machine_config: Option<MachineConfiguration>,
    drives: Vec<Drive>,
    networks: Vec<NetworkInterface>,
    pmems: Vec<Pmem>,
    vsock: Option<Vsock>,
    balloon: Option<Balloon>,
}

/// A VMM process plus its control-API client. Construct via [`crate::RuntimeProcessBuilder`].
///
/// This is the process/API wrapper shared by the VM instance driver: the
/// container driver does not use it, since its guest runs as a namespaced
/// process tree rather than a separate VMM binary.
#[derive(Debug)]
pub struct RuntimeProcess {
    binary: PathBuf,
    args: Vec<String>,
    client: Option<crate::api::RuntimeApiClient>,
    child: Option<Child>,
    state: InstanceState,
    config: RuntimeConfig,
    instance_info: Option<InstanceInfo>,
}

impl RuntimeProcess {
    pub(crate) fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            client: None,
            child: None,
            state: InstanceState::NotStarted,
            config: RuntimeConfig::default(),
            instance_info: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state.clone()
    }

    pub fn instance_info(&self) -> Option<&InstanceInfo> {
        self.instance_info.as_ref()
    }

    /// Raw control-API client, for calls not covered by this wrapper
    /// (e.g. the migration session issuing `put_snapshot_create` directly).
    pub fn api(&self) -> Result<&crate::api::RuntimeApiClient, Error> {
        self.client
            .as_ref()
            .ok_or(Error::InvalidState("vmm process not started"))
    }

    fn ensure_not_started(&self) -> Result<(), Error> {
        match self.state {
            InstanceState::NotStarted => Ok(()),
            _ => Err(Error::InvalidState(
                "cannot modify configuration after the vmm process has started",
            )),
        }
    }

    pub fn set_boot_source(&mut self, boot_source: BootSource) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.boot_source = Some(boot_source);
        Ok(())
    }

    pub fn set_machine_config(&mut self, machine_config: MachineConfiguration) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.machine_config = Some(machine_config);
        Ok(())
    }

    pub fn add_drive(&mut self, drive: Drive) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.drives.push(drive);
        Ok(())
    }

    pub fn add_network(&mut self, network: NetworkInterface) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.networks.push(network);
        Ok(())
    }

    pub fn add_pmem(&mut self, pmem: Pmem) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.pmems.push(pmem);
        Ok(())
    }

    pub fn set_vsock(&mut self, vsock: Vsock) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.vsock = Some(vsock);
        Ok(())
    }

    pub fn set_balloon(&mut self, balloon: Balloon) -> Result<(), Error> {
        self.ensure_not_started()?;
        self.config.balloon = Some(balloon);
        Ok(())
    }

    pub(crate) fn add_arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into())
    }

    async fn apply_config(&self) -> Result<(), Error> {
        let client = self
            .client
            .as_ref()
            .ok_or(Error::InvalidState("control api client not available"))?;

        if let Some(boot_source) = &self.config.boot_source {
            client.put_boot_source(boot_source).await?;
        }
        if let Some(machine_config) = &self.config.machine_config {
            client.put_machine_config(machine_config).await?;
        }
        for drive in &self.config.drives {
            client.put_drives(drive).await?;
        }
        for network in &self.config.networks {
            client.put_network_interface(network).await?;
        }
        for pmem in &self.config.pmems {
            client.put_pmem(pmem).await?;
        }
        if let Some(vsock) = &self.config.vsock {
            client.put_vsock(vsock).await?;
        }
        if let Some(balloon) = &self.config.balloon {
            client.put_balloon(balloon).await?;
        }

        Ok(())
    }

    /// Spawn the VMM binary, wait for its control socket, apply the staged
    /// configuration and issue `InstanceStart`.
    pub async fn start(&mut self, api_socket: impl Into<PathBuf>) -> Result<(), Error> {
        if self.state != InstanceState::NotStarted {
            return Err(Error::InvalidState("vmm process already started"));
        }

        let child = Command::new(&self.binary)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let api_socket = api_socket.into();
        match timeout(Duration::from_secs(5), async {
            loop {
                match tokio::net::UnixStream::connect(&api_socket).await {
                    Ok(_) => break,
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await
        {
            Ok(_) => (),
            Err(_) => return Err(Error::CannotConnectApiSocket),
        }

        let client = crate::api::RuntimeApiClient::new(api_socket);
        let instance_info = client.get_instance_info().await?;

        self.client = Some(client);
        self.child = Some(child);
        self.instance_info = Some(instance_info);

        self.apply_config().await?;

        self.client
            .as_ref()
            .ok_or(Error::InvalidState("control api client not available"))?
            .put_actions(&InstanceActionInfo {
                action_type: ActionType::InstanceStart,
            })
            .await?;

        self.state = InstanceState::Running;

        Ok(())
    }

    /// Restore a VMM process from a previously created snapshot. The caller
    /// is responsible for spawning the binary in "load-from-snapshot" mode
    /// via the builder before calling this.
    pub async fn load_snapshot(
        &mut self,
        api_socket: impl Into<PathBuf>,
        options: &crate::dto::SnapshotLoadParams,
    ) -> Result<(), Error> {
        if self.state != InstanceState::NotStarted {
            return Err(Error::InvalidState("vmm process already started"));
        }

        let child = Command::new(&self.binary)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let api_socket = api_socket.into();
        match timeout(Duration::from_secs(5), async {
            loop {
                match tokio::net::UnixStream::connect(&api_socket).await {
                    Ok(_) => break,
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await
        {
            Ok(_) => (),
            Err(_) => return Err(Error::CannotConnectApiSocket),
        }

        let client = crate::api::RuntimeApiClient::new(api_socket);
        client.put_snapshot_load(options).await?;
        let instance_info = client.get_instance_info().await?;

        self.child = Some(child);
        self.state = if options.resume_vm == Some(true) {
            InstanceState::Running
        } else {
            InstanceState::Paused
        };
        self.instance_info = Some(instance_info);
        self.client = Some(client);

        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), Error> {
        if self.state != InstanceState::Running {
            return Err(Error::InvalidState("cannot pause: vm is not running"));
        }

        let client = self
            .client
            .as_ref()
            .ok_or(Error::InvalidState("control api client not available"))?;

        client.patch_vm(&VmState::Paused).await?;
        self.state = InstanceState::Paused;

        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), Error> {
        if self.state != InstanceState::Paused {
            return Err(Error::InvalidState("cannot resume: vm is not paused"));
        }

        let client = self
            .client
            .as_ref()
            .ok_or(Error::InvalidState("control api client not available"))?;

        client.patch_vm(&VmState::Running).await?;
        self.state = InstanceState::Running;

        Ok(())
    }

    /// Create a snapshot of the (paused) VM; caller pauses first via [`Self::pause`].
    pub async fn create_snapshot(
        &self,
        options: &crate::dto::SnapshotCreateParams,
    ) -> Result<(), Error> {
        if self.state != InstanceState::Paused {
            return Err(Error::InvalidState("cannot snapshot: vm is not paused"));
        }
        self.api()?.put_snapshot_create(options).await?;
        Ok(())
    }

    /// Request guest shutdown, then forcefully kill the process if it does
    /// not exit in time.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        if let Some(client) = &self.client {
            let _ = client
                .put_actions(&InstanceActionInfo {
                    action_type: ActionType::SendCtrlAltDel,
                })
                .await;
        }

        if let Some(mut child) = self.child.take() {
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
            let _ = child.start_kill();
        }

        self.client = None;
        self.child = None;
        self.state = InstanceState::Stopped;
        self.instance_info = None;

        Ok(())
    }

    /// Kill the process immediately, no guest-visible shutdown attempt.
    pub async fn kill(&mut self) -> Result<(), Error> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.client = None;
        self.state = InstanceState::Stopped;
        self.instance_info = None;
        Ok(())
    }
}

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
