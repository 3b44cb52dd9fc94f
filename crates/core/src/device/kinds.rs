//! The thinner device kinds (spec §2 item 5): nic, unix-char, unix-block,
//! gpu, proxy, infiniband, tpm, pci, usb. Structurally complete (every
//! trait method is exercised) but without the disk kind's deep policy,
//! which lives in [`super::disk`].
use super::{Device, DeviceError, InstanceHandle, RunConfig};
use crate::model::{DeviceConfig, ExpandedConfig};

macro_rules! simple_device {
    ($ty:ident, $type_name:literal, hotplug = $hotplug:expr, migrate = $migrate:expr, updatable = [$($field:literal),*]) => {
        pub struct $ty {
            name: String,
            config: DeviceConfig,
        }

        impl $ty {
            pub const UPDATABLE_FIELDS: &'static [&'static str] = &[$($field),*];

            pub fn new(name: &str, config: &DeviceConfig) -> Self {
                Self {
                    name: name.to_string(),
                    config: config.clone(),
                }
            }
        }

        #[async_trait::async_trait]
        impl Device for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn validate(&self, _expanded: &ExpandedConfig) -> Result<(), DeviceError> {
                if self.config.device_type != $type_name {
                    return Err(DeviceError::Validation(format!(
                        "device {} is not of type {}",
                        self.name, $type_name
                    )));
                }
                Ok(())
            }

            fn pre_start_check(&self, _inst: &dyn InstanceHandle) -> Result<(), DeviceError> {
                Ok(())
            }

            async fn start(&self, _inst: &dyn InstanceHandle) -> Result<RunConfig, DeviceError> {
                Ok(RunConfig::default())
            }

            async fn stop(&self, _inst: &dyn InstanceHandle) -> Result<(), DeviceError> {
                Ok(())
            }

            async fn update(
                &self,
                _inst: &dyn InstanceHandle,
                _old: &DeviceConfig,
            ) -> Result<(), DeviceError> {
                Ok(())
            }

            fn register(&self) -> Result<(), DeviceError> {
                Ok(())
            }

            fn remove(&self) -> Result<(), DeviceError> {
                Ok(())
            }

            fn can_hotplug(&self) -> bool {
                $hotplug
            }

            fn can_migrate(&self) -> bool {
                $migrate
            }

            fn updatable_fields(&self) -> &'static [&'static str] {
                Self::UPDATABLE_FIELDS
            }
        }
    };
}

simple_device!(
    NicDevice,
    "nic",
    hotplug = true,
    migrate = true,
    updatable = ["limits.ingress", "limits.egress", "host_name"]
);
simple_device!(
    UnixCharDevice,
    "unix-char",
    hotplug = true,
    migrate = false,
    updatable = ["uid", "gid", "mode"]
);
simple_device!(
    UnixBlockDevice,
    "unix-block",
    hotplug = true,
    migrate = false,
    updatable = ["uid", "gid", "mode"]
);
simple_device!(
    GpuDevice,
    "gpu",
    hotplug = false,
    migrate = false,
    updatable = []
);
simple_device!(
    ProxyDevice,
    "proxy",
    hotplug = true,
    migrate = false,
    updatable = ["listen", "connect"]
);
simple_device!(
    InfinibandDevice,
    "infiniband",
    hotplug = false,
    migrate = false,
    updatable = []
);
simple_device!(
    TpmDevice,
    "tpm",
    hotplug = false,
    migrate = false,
    updatable = []
);
simple_device!(
    PciDevice,
    "pci",
    hotplug = false,
    migrate = false,
    updatable = []
);
simple_device!(
    UsbDevice,
    "usb",
    hotplug = true,
    migrate = false,
    updatable = []
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(device_type: &str) -> DeviceConfig {
        DeviceConfig {
            device_type: device_type.to_string(),
            config: BTreeMap::new(),
        }
    }

    #[test]
    fn nic_is_hotpluggable_and_migratable() {
        let nic = NicDevice::new("eth0", &config("nic"));
        assert!(nic.can_hotplug());
        assert!(nic.can_migrate());
        assert_eq!(nic.updatable_fields(), NicDevice::UPDATABLE_FIELDS);
    }

    #[test]
    fn gpu_is_neither_hotpluggable_nor_migratable() {
        let gpu = GpuDevice::new("gpu0", &config("gpu"));
        assert!(!gpu.can_hotplug());
        assert!(!gpu.can_migrate());
    }

    #[test]
    fn validate_rejects_type_mismatch() {
        let nic = NicDevice::new("eth0", &config("gpu"));
        let expanded = ExpandedConfig::default();
        assert!(nic.validate(&expanded).is_err());
    }
}
