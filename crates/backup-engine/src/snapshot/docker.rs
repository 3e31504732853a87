use std::{
    io::{self, Read, Write},
    process::{Command, Output, Stdio},
};

use serde_json::Value;
use shared::TargetName;
use tracing::debug;

use super::{
    ContentDescriptor, NetworkSettings, PortMapping, RestoreApplicator, RestoreOptions,
    SnapshotError, SnapshotProvider, TargetType, VolumeMount,
};
use crate::config::DockerConfig;

/// Talks to the container engine through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    helper_image: String,
}

impl DockerCli {
    /// Create a client from the config.
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            helper_image: config.helper_image.clone(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn run(&self, args: &[&str]) -> Result<Output, SnapshotError> {
        debug!("Running {} {}", self.binary, args.join(" "));

        let output = self
            .command()
            .args(args)
            .output()
            .map_err(SnapshotError::RunCommand)?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(SnapshotError::CommandErrored(error));
        }

        Ok(output)
    }

    /// Inspect an object, returning `None` when it does not exist.
    fn inspect(&self, args: &[&str]) -> Result<Option<Value>, SnapshotError> {
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(SnapshotError::RunCommand)?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            if error.contains("No such") || error.contains("not found") {
                return Ok(None);
            }
            return Err(SnapshotError::CommandErrored(error.to_string()));
        }

        let value: Value = serde_json::from_slice(&output.stdout)?;
        Ok(value.as_array().and_then(|objects| objects.first()).cloned())
    }

    fn describe_container(target: &TargetName, container: &Value) -> ContentDescriptor {
        let image = container
            .pointer("/Config/Image")
            .and_then(Value::as_str)
            .map(str::to_string);

        let environment = container
            .pointer("/Config/Env")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let volumes = container
            .get("Mounts")
            .and_then(Value::as_array)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|mount| mount.get("Type").and_then(Value::as_str) == Some("volume"))
                    .filter_map(|mount| {
                        Some(VolumeMount {
                            name: mount.get("Name")?.as_str()?.to_string(),
                            destination: mount.get("Destination")?.as_str()?.to_string(),
                            read_only: !mount.get("RW").and_then(Value::as_bool).unwrap_or(true),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut ports = Vec::new();
        if let Some(bindings) = container
            .pointer("/HostConfig/PortBindings")
            .and_then(Value::as_object)
        {
            for (container_port, hosts) in bindings {
                for host in hosts.as_array().into_iter().flatten() {
                    ports.push(PortMapping {
                        container_port: container_port.clone(),
                        host_ip: host
                            .get("HostIp")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        host_port: host
                            .get("HostPort")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }

        ContentDescriptor {
            target: target.clone(),
            target_type: TargetType::Container,
            image,
            volumes,
            ports,
            environment,
            network: None,
        }
    }

    fn describe_network(target: &TargetName, network: &Value) -> ContentDescriptor {
        let driver = network
            .get("Driver")
            .and_then(Value::as_str)
            .unwrap_or("bridge")
            .to_string();

        let subnets = network
            .pointer("/IPAM/Config")
            .and_then(Value::as_array)
            .map(|configs| {
                configs
                    .iter()
                    .filter_map(|config| config.get("Subnet").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        ContentDescriptor {
            target: target.clone(),
            target_type: TargetType::Network,
            image: None,
            volumes: Vec::new(),
            ports: Vec::new(),
            environment: Vec::new(),
            network: Some(NetworkSettings { driver, subnets }),
        }
    }

    fn create_container(
        &self,
        descriptor: &ContentDescriptor,
        options: &RestoreOptions,
    ) -> Result<String, SnapshotError> {
        let Some(image) = &descriptor.image else {
            return Err(SnapshotError::Describe(
                descriptor.target.to_string(),
                "the container has no image".to_string(),
            ));
        };
        let name = options.target_name(&descriptor.target).to_string();

        let mut args: Vec<String> = vec!["create".into(), "--name".into(), name.clone()];

        for volume in &descriptor.volumes {
            let mut mount = format!("{}:{}", options.volume_name(&volume.name), volume.destination);
            if volume.read_only {
                mount.push_str(":ro");
            }
            args.extend(["-v".into(), mount]);
        }

        for port in &descriptor.ports {
            let host_port = options
                .port_overrides
                .get(&port.container_port)
                .unwrap_or(&port.host_port);

            let binding = if port.host_ip.is_empty() {
                format!("{host_port}:{}", port.container_port)
            } else {
                format!("{}:{host_port}:{}", port.host_ip, port.container_port)
            };
            args.extend(["-p".into(), binding]);
        }

        for variable in &descriptor.environment {
            args.extend(["-e".into(), variable.clone()]);
        }

        args.push(image.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args)?;

        if options.start {
            self.run(&["start", &name])?;
        }

        Ok(name)
    }

    fn create_network(
        &self,
        descriptor: &ContentDescriptor,
        options: &RestoreOptions,
    ) -> Result<String, SnapshotError> {
        let name = options.target_name(&descriptor.target).to_string();
        let settings = descriptor.network.clone().unwrap_or_default();

        let mut args: Vec<String> = vec!["network".into(), "create".into()];
        if !settings.driver.is_empty() {
            args.extend(["--driver".into(), settings.driver]);
        }
        for subnet in settings.subnets {
            args.extend(["--subnet".into(), subnet]);
        }
        args.push(name.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args)?;

        Ok(name)
    }
}

impl SnapshotProvider for DockerCli {
    fn describe(&self, target: &TargetName) -> Result<ContentDescriptor, SnapshotError> {
        if let Some(container) = self.inspect(&["inspect", "--type", "container", target.as_str()])? {
            return Ok(Self::describe_container(target, &container));
        }

        if let Some(network) = self.inspect(&["network", "inspect", target.as_str()])? {
            return Ok(Self::describe_network(target, &network));
        }

        Err(SnapshotError::NotFound(target.to_string()))
    }

    fn export_volume(&self, volume: &str, writer: &mut dyn Write) -> Result<(), SnapshotError> {
        let mount = format!("{volume}:/data:ro");

        let mut child = self
            .command()
            .args(["run", "--rm", "-v", &mount, &self.helper_image])
            .args(["tar", "-cf", "-", "-C", "/data", "."])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SnapshotError::RunCommand)?;

        let copied = match child.stdout.as_mut() {
            Some(stdout) => io::copy(stdout, writer).map(|_| ()),
            None => Err(io::Error::other("no stdout")),
        };

        let output = child.wait_with_output().map_err(SnapshotError::RunCommand)?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(SnapshotError::CommandErrored(error));
        }

        copied.map_err(|e| SnapshotError::Io(e, "stream the volume"))
    }
}

impl RestoreApplicator for DockerCli {
    fn import_volume(&self, volume: &str, reader: &mut dyn Read) -> Result<(), SnapshotError> {
        self.run(&["volume", "create", volume])?;

        let mount = format!("{volume}:/data");

        let mut child = self
            .command()
            .args(["run", "--rm", "-i", "-v", &mount, &self.helper_image])
            .args(["tar", "-xf", "-", "-C", "/data"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SnapshotError::RunCommand)?;

        // Dropping stdin closes it so tar sees the end of the stream.
        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(reader, &mut stdin).and_then(|_| stdin.flush()),
            None => Err(io::Error::other("no stdin")),
        };

        let output = child.wait_with_output().map_err(SnapshotError::RunCommand)?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(SnapshotError::CommandErrored(error));
        }

        copied.map_err(|e| SnapshotError::Io(e, "stream the volume"))
    }

    fn apply(&self, descriptor: &ContentDescriptor, options: &RestoreOptions) -> Result<String, SnapshotError> {
        match descriptor.target_type {
            TargetType::Container => self.create_container(descriptor, options),
            TargetType::Network => self.create_network(descriptor, options),
        }
    }
}
