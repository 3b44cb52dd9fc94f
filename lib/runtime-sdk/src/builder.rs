//! Builder for an unstarted [`RuntimeProcess`].
use crate::dto::LoggerLevel;
use crate::process::RuntimeProcess;
use std::path::PathBuf;

macro_rules! with {
    ($field_name:expr, Option<$inner_type:ty>) => {
        paste::paste! {
            pub fn [<with_ $field_name>](&mut self, $field_name: $inner_type) -> &mut Self {
                self.[<$field_name>] = Some($field_name);
                self
            }
        }
    };
    ($field_name:expr, $field_type:ty) => {
        paste::paste! {
            pub fn [<with_ $field_name>](&mut self, $field_name: $field_type) -> &mut Self {
                self.[<$field_name>] = $field_name;
                self
            }
        }
    };
}

#[derive(Debug, Default, Clone)]
pub struct RuntimeProcessBuilder {
    binary: PathBuf,
    api_socket_path: Option<PathBuf>,
    config_file: Option<PathBuf>,
    id: Option<String>,
    logger_level: Option<LoggerLevel>,
    log_file: Option<PathBuf>,
    metrics_file: Option<PathBuf>,
    seccomp_filter: Option<String>,
    disable_seccomp: Option<bool>,
}

impl RuntimeProcessBuilder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }

    pub fn build(self) -> Result<RuntimeProcess, crate::Error> {
        let binary = &self.binary;

        if !binary.exists() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "vmm binary not found: {}",
                binary.display()
            )));
        }
        if !binary.is_file() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "vmm binary path is not a file: {}",
                binary.display()
            )));
        }
        if self.api_socket_path.is_none() && self.config_file.is_none() {
            return Err(crate::Error::InvalidConfiguration(
                "control socket path or configuration file must be specified".to_string(),
            ));
        }
        if let Some(ref path) = self.seccomp_filter {
            let path_buf = std::path::Path::new(path);
            if !path_buf.exists() {
                return Err(crate::Error::InvalidConfiguration(format!(
                    "seccomp filter file not found: {}",
                    path
                )));
            }
        }

        let mut process = RuntimeProcess::new(self.binary);

        if let Some(path) = self.api_socket_path {
            process.add_arg("--api-sock");
            process.add_arg(path.to_string_lossy().to_string());
        }
        if let Some(path) = self.config_file {
            process.add_arg("--config-file");
            process.add_arg(path.to_string_lossy().to_string());
        }
        if let Some(id) = self.id {
            process.add_arg("--id");
            process.add_arg(id);
        }
        if let Some(level) = self.logger_level {
            let level: String = level.into();
            process.add_arg("--level");
            process.add_arg(level);
        }
        if let Some(path) = self.log_file {
            process.add_arg("--log-path");
            process.add_arg(path.to_string_lossy().to_string());
        }
        if let Some(path) = self.metrics_file {
            process.add_arg("--metrics-path");
            process.add_arg(path.to_string_lossy().to_string());
        }
        if self.disable_seccomp == Some(true) {
            process.add_arg("--no-seccomp");
        }
        if let Some(filter) = self.seccomp_filter {
            process.add_arg("--seccomp-filter");
            process.add_arg(filter);
        }

        Ok(process)
    }
}

impl RuntimeProcessBuilder {
    with!(binary, PathBuf);
    with!(api_socket_path, Option<PathBuf>);
    with!(config_file, Option<PathBuf>);
    with!(id, Option<String>);
    with!(logger_level, Option<LoggerLevel>);
    with!(log_file, Option<PathBuf>);
    with!(metrics_file, Option<PathBuf>);
    with!(disable_seccomp, Option<bool>);
    with!(seccomp_filter, Option<String>);
}
