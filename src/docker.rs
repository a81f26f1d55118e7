//! Talks to the swarm engine: creates and removes the services and overlay
//! networks that realize an instance, and manages challenge images.

use bollard::auth::DockerCredentials;
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::models::{
    EndpointSettings, EndpointSpec, EndpointSpecModeEnum, Ipam, IpamConfig, Limit,
    NetworkAttachmentConfig, ServiceSpec, TaskSpec, TaskSpecContainerSpec,
    TaskSpecContainerSpecDnsConfig, TaskSpecPlacement, TaskSpecResources,
};
use bollard::service::ListServicesOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::placement::{self, PlacementError};
use crate::pool::{AddressPool, PoolError};
use crate::types::{Challenge, ImageInfo, Instance};
use crate::{config, INSTANCE_LABEL};

const CONNECT_TIMEOUT: u64 = 120;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(
        "engine connection error: {0}. \
         Check the configured docker api_url; if you are using \
         unix:///var/run/docker.sock, check that the socket is mapped"
    )]
    Connect(String),
    #[error("bad registry credentials, expected \"username:password\"")]
    Credentials,
    #[error("challenge image parse error ({0}), check the challenge image string")]
    Topology(String),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("engine api error")]
    Api(#[from] bollard::errors::Error),
}

/// The engine handle every request path sees: empty until a successful
/// init/reinit. Cloned out of the slot before any engine call so no lock is
/// held across I/O.
pub type SharedEngine = Arc<RwLock<Option<Engine>>>;

#[derive(Clone)]
pub struct Engine {
    docker: Docker,
    credentials: Option<DockerCredentials>,
    cfg: config::Docker,
}

impl Engine {
    pub async fn connect(cfg: &config::Docker) -> Result<Self, EngineError> {
        let docker = if cfg.api_url.starts_with("unix://") {
            Docker::connect_with_unix(&cfg.api_url, CONNECT_TIMEOUT, API_DEFAULT_VERSION)
        } else if cfg.use_ssl {
            match (&cfg.ssl_client_key, &cfg.ssl_client_cert, &cfg.ssl_ca_cert) {
                (Some(key), Some(cert), Some(ca)) => Docker::connect_with_ssl(
                    &cfg.api_url,
                    Path::new(key),
                    Path::new(cert),
                    Path::new(ca),
                    CONNECT_TIMEOUT,
                    API_DEFAULT_VERSION,
                ),
                _ => {
                    return Err(EngineError::Connect(
                        "use_ssl is set but ssl_ca_cert/ssl_client_cert/ssl_client_key are not"
                            .to_string(),
                    ))
                }
            }
        } else {
            Docker::connect_with_http(&cfg.api_url, CONNECT_TIMEOUT, API_DEFAULT_VERSION)
        }
        .map_err(|e| EngineError::Connect(e.to_string()))?;

        // surface an unreachable daemon at init instead of on the first
        // user request
        docker
            .version()
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;

        let credentials = match &cfg.credentials {
            Some(raw) => Some(parse_credentials(raw)?),
            None => None,
        };

        Ok(Self {
            docker,
            credentials,
            cfg: cfg.clone(),
        })
    }

    // == images ==

    pub async fn images_by_prefix(&self, prefix: &str) -> Result<Vec<ImageInfo>, EngineError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await?;

        let mut out = Vec::new();
        for image in &images {
            for tag in &image.repo_tags {
                if !tag.starts_with(prefix) {
                    continue;
                }
                out.push(ImageInfo {
                    name: tag.clone(),
                    short_name: tag
                        .strip_prefix(prefix)
                        .unwrap_or(tag)
                        .trim_start_matches('/')
                        .to_string(),
                    id: image.id.chars().take(19).collect(),
                    size: format_size(image.size),
                    created: format_created(image.created),
                });
            }
        }
        // newest first
        out.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(out)
    }

    /// Pulls `name`, re-authenticating and retrying once if the registry
    /// rejects the first attempt. The single documented retry in this
    /// subsystem; everything else fails closed.
    pub async fn pull_image(&self, name: &str) -> Result<(), EngineError> {
        match self.try_pull(name, self.credentials.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if is_auth_error(&e) && self.cfg.credentials.is_some() => {
                let raw = self.cfg.credentials.as_deref().unwrap_or_default();
                let credentials = parse_credentials(raw)?;
                Ok(self.try_pull(name, Some(credentials)).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_pull(
        &self,
        name: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), bollard::errors::Error> {
        let options = CreateImageOptions::<String> {
            from_image: name.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    pub async fn remove_image(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_image(
                name,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    // == instances ==

    pub async fn create_instance(
        &self,
        instance: &Instance,
        challenge: &Challenge,
        pool: &AddressPool,
    ) -> Result<(), EngineError> {
        match parse_topology(&challenge.image)? {
            Topology::Standalone(image) => {
                self.create_standalone(instance, challenge, &image).await
            }
            Topology::Grouped(components) => {
                self.create_grouped(instance, challenge, components, pool).await
            }
        }
    }

    async fn create_standalone(
        &self,
        instance: &Instance,
        challenge: &Challenge,
        image: &str,
    ) -> Result<(), EngineError> {
        let node = placement::choose_node(image, &self.cfg.swarm_nodes)?;

        if self.credentials.is_some() {
            self.pull_image(image).await?;
        }

        let key = instance.engine_key();
        let spec = self.service_spec(
            challenge,
            &key,
            ServiceParams {
                name: key.clone(),
                image: image.to_string(),
                network: NetworkAttachmentConfig {
                    target: Some(self.cfg.auto_connect_network.clone()),
                    ..Default::default()
                },
                hostname: None,
                env: vec![format!("FLAG={}", instance.flag)],
                cap_add: None,
                dns: self.cfg.dns.clone(),
                node,
            },
        );

        self.docker
            .create_service(spec, self.credentials.clone())
            .await?;
        Ok(())
    }

    async fn create_grouped(
        &self,
        instance: &Instance,
        challenge: &Challenge,
        components: Vec<Component>,
        pool: &AddressPool,
    ) -> Result<(), EngineError> {
        let key = instance.engine_key();
        let range = pool.acquire().await?;

        let create = CreateNetworkOptions::<String> {
            name: key.clone(),
            driver: "overlay".to_string(),
            internal: true,
            attachable: true,
            ipam: Ipam {
                driver: Some("default".to_string()),
                config: Some(vec![IpamConfig {
                    subnet: Some(range.clone()),
                    ..Default::default()
                }]),
                options: None,
            },
            labels: HashMap::from([("prefix".to_string(), range.clone())]),
            ..Default::default()
        };
        if let Err(e) = self.docker.create_network(create).await {
            // nothing owns the range yet, hand it straight back
            let _ = pool.release(&range).await;
            return Err(e.into());
        }

        // attach the always-present helpers; a helper named *dns* becomes
        // the resolver for every component
        let mut dns = Vec::new();
        for aux in &self.cfg.auto_connect_containers {
            if aux.is_empty() {
                continue;
            }
            self.docker
                .connect_network(
                    &key,
                    ConnectNetworkOptions {
                        container: aux.clone(),
                        endpoint_config: EndpointSettings::default(),
                    },
                )
                .await?;

            if aux.contains("dns") {
                let network = self
                    .docker
                    .inspect_network(
                        &key,
                        Some(InspectNetworkOptions::<String> {
                            verbose: true,
                            scope: "swarm".to_string(),
                        }),
                    )
                    .await?;
                for attached in network.containers.unwrap_or_default().values() {
                    if attached.name.as_deref() == Some(aux.as_str()) {
                        if let Some(addr) = &attached.ipv4_address {
                            dns.push(addr.split('/').next().unwrap_or(addr).to_string());
                        }
                    }
                }
            }
        }

        // the first component is the primary: it carries the instance's own
        // suffix (so removal-by-label finds it) and decides placement
        let primary = &components[0];
        let node = placement::choose_node(&primary.image, &self.cfg.swarm_nodes)?;

        for (i, component) in components.iter().enumerate() {
            let service_name = if i == 0 {
                key.clone()
            } else {
                format!("{}-{}", instance.user_id, Uuid::new_v4())
            };

            let mut env = Vec::new();
            if component.flag {
                env.push(format!("FLAG={}", instance.flag));
            }

            let spec = self.service_spec(
                challenge,
                &key,
                ServiceParams {
                    name: service_name,
                    image: component.image.clone(),
                    network: NetworkAttachmentConfig {
                        target: Some(key.clone()),
                        aliases: Some(vec![component.name.clone()]),
                        ..Default::default()
                    },
                    hostname: Some(component.name.clone()),
                    env,
                    cap_add: if component.extra_cap.is_empty() {
                        None
                    } else {
                        Some(component.extra_cap.clone())
                    },
                    dns: dns.clone(),
                    node: node.clone(),
                },
            );

            self.docker
                .create_service(spec, self.credentials.clone())
                .await?;
        }

        Ok(())
    }

    fn service_spec(&self, challenge: &Challenge, key: &str, params: ServiceParams) -> ServiceSpec {
        ServiceSpec {
            name: Some(params.name),
            labels: Some(HashMap::from([(
                INSTANCE_LABEL.to_string(),
                key.to_string(),
            )])),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(params.image),
                    hostname: params.hostname,
                    env: Some(params.env),
                    capability_add: params.cap_add,
                    dns_config: Some(TaskSpecContainerSpecDnsConfig {
                        nameservers: Some(params.dns),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                resources: Some(TaskSpecResources {
                    limits: Some(Limit {
                        memory_bytes: Some(convert_readable_text(&challenge.memory_limit)),
                        nano_cp_us: Some((challenge.cpu_limit * 1e9) as i64),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                placement: Some(TaskSpecPlacement {
                    constraints: Some(vec![format!("node.labels.name=={}", params.node)]),
                    ..Default::default()
                }),
                networks: Some(vec![params.network]),
                ..Default::default()
            }),
            // name-based resolution only, no published ports
            endpoint_spec: Some(EndpointSpec {
                mode: Some(EndpointSpecModeEnum::DNSRR),
                ports: None,
            }),
            ..Default::default()
        }
    }

    /// Removes every engine object labeled with this instance's key. Safe on
    /// partially created and already-removed instances.
    pub async fn remove_instance(
        &self,
        user_id: i32,
        uuid: &str,
        pool: &AddressPool,
    ) -> Result<(), EngineError> {
        let key = format!("{user_id}-{uuid}");

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{INSTANCE_LABEL}={key}")],
        )]);
        let services = self
            .docker
            .list_services(Some(ListServicesOptions {
                filters,
            }))
            .await?;
        for service in services {
            if let Some(id) = service.id {
                self.docker.delete_service(&id).await?;
            }
        }

        let filters = HashMap::from([("name".to_string(), vec![key.clone()])]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        for network in networks {
            // the name filter matches substrings; pin it down
            if network.name.as_deref() != Some(key.as_str()) {
                continue;
            }

            for aux in &self.cfg.auto_connect_containers {
                if aux.is_empty() {
                    continue;
                }
                // best effort, removal of the network proceeds regardless
                if let Err(e) = self
                    .docker
                    .disconnect_network(
                        &key,
                        DisconnectNetworkOptions {
                            container: aux.clone(),
                            force: true,
                        },
                    )
                    .await
                {
                    debug!("disconnecting {aux} from {key} failed: {e}");
                }
            }

            let range = network
                .labels
                .as_ref()
                .and_then(|labels| labels.get("prefix"))
                .cloned();

            self.docker.remove_network(&key).await?;

            // only recycle once the network object is confirmed gone
            if let Some(range) = range {
                pool.release(&range).await?;
            }
        }

        Ok(())
    }
}

struct ServiceParams {
    name: String,
    image: String,
    network: NetworkAttachmentConfig,
    hostname: Option<String>,
    env: Vec<String>,
    cap_add: Option<Vec<String>>,
    dns: Vec<String>,
    node: String,
}

fn parse_credentials(raw: &str) -> Result<DockerCredentials, EngineError> {
    match raw.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(DockerCredentials {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }),
        _ => Err(EngineError::Credentials),
    }
}

fn is_auth_error(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            ..
        }
    )
}

// == topology ==

#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    Standalone(String),
    /// ordered: the first component is the primary
    Grouped(Vec<Component>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: String,
    pub image: String,
    pub extra_cap: Vec<String>,
    /// whether the shared secret is injected into this component
    pub flag: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ComponentSpec {
    Image(String),
    Detailed {
        image: String,
        #[serde(default)]
        extra_cap: Vec<String>,
        #[serde(default = "default_true")]
        flag: bool,
    },
}

fn default_true() -> bool {
    true
}

/// A plain reference is a standalone instance; a JSON object maps logical
/// component names to sub-image configs for a grouped topology.
pub fn parse_topology(image: &str) -> Result<Topology, EngineError> {
    if !image.trim_start().starts_with('{') {
        return Ok(Topology::Standalone(image.to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_str(image).map_err(|e| EngineError::Topology(e.to_string()))?;
    let map = value
        .as_object()
        .ok_or_else(|| EngineError::Topology("expected an object".to_string()))?;
    if map.is_empty() {
        return Err(EngineError::Topology("no components".to_string()));
    }

    let mut components = Vec::with_capacity(map.len());
    for (name, spec) in map {
        let spec: ComponentSpec = serde_json::from_value(spec.clone())
            .map_err(|e| EngineError::Topology(format!("component '{name}': {e}")))?;
        components.push(match spec {
            ComponentSpec::Image(image) => Component {
                name: name.clone(),
                image,
                extra_cap: Vec::new(),
                flag: true,
            },
            ComponentSpec::Detailed {
                image,
                extra_cap,
                flag,
            } => Component {
                name: name.clone(),
                image,
                extra_cap,
                flag,
            },
        });
    }

    Ok(Topology::Grouped(components))
}

/// `"128m"` → bytes. Unrecognized input is 0, not an error; the engine then
/// runs the service unlimited rather than failing the request.
pub fn convert_readable_text(text: &str) -> i64 {
    let lower = text.to_lowercase();

    let (number, multiplier) = if let Some(number) = lower.strip_suffix('k') {
        (number, 1024)
    } else if let Some(number) = lower.strip_suffix('m') {
        (number, 1024 * 1024)
    } else if let Some(number) = lower.strip_suffix('g') {
        (number, 1024 * 1024 * 1024)
    } else {
        return 0;
    };

    number.parse::<i64>().map_or(0, |n| n * multiplier)
}

fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes <= 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

fn format_created(epoch_seconds: i64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp(epoch_seconds, 0) {
        Some(created) => created.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_units_convert_to_bytes() {
        assert_eq!(convert_readable_text("128m"), 134217728);
        assert_eq!(convert_readable_text("1g"), 1073741824);
        assert_eq!(convert_readable_text("4k"), 4096);
        assert_eq!(convert_readable_text("2G"), 2147483648);
    }

    #[test]
    fn unrecognized_memory_text_is_zero() {
        assert_eq!(convert_readable_text("128"), 0);
        assert_eq!(convert_readable_text("lots"), 0);
        assert_eq!(convert_readable_text(""), 0);
        assert_eq!(convert_readable_text("xm"), 0);
    }

    #[test]
    fn plain_reference_is_standalone() {
        assert_eq!(
            parse_topology("registry.local/web:latest").unwrap(),
            Topology::Standalone("registry.local/web:latest".to_string())
        );
    }

    #[test]
    fn grouped_topology_preserves_order_and_defaults() {
        let raw = r#"{
            "web": "registry.local/web:latest",
            "db": {"image": "registry.local/db:latest", "flag": false},
            "vpn": {"image": "registry.local/vpn:latest", "extra_cap": ["NET_ADMIN"]}
        }"#;

        let topology = parse_topology(raw).unwrap();
        let Topology::Grouped(components) = topology else {
            panic!("expected grouped");
        };

        assert_eq!(components.len(), 3);
        // the first listed component is the primary
        assert_eq!(components[0].name, "web");
        assert!(components[0].flag);
        assert!(components[0].extra_cap.is_empty());

        assert_eq!(components[1].name, "db");
        assert!(!components[1].flag);

        assert_eq!(components[2].name, "vpn");
        assert!(components[2].flag);
        assert_eq!(components[2].extra_cap, vec!["NET_ADMIN".to_string()]);
    }

    #[test]
    fn malformed_topology_is_rejected_before_any_engine_call() {
        assert!(matches!(
            parse_topology(r#"{"web": "#),
            Err(EngineError::Topology(_))
        ));
        assert!(matches!(parse_topology("{}"), Err(EngineError::Topology(_))));
        assert!(matches!(
            parse_topology(r#"{"web": {"flag": true}}"#),
            Err(EngineError::Topology(_))
        ));
    }

    #[test]
    fn credentials_must_be_colon_separated() {
        assert!(parse_credentials("admin:hunter2").is_ok());
        assert!(parse_credentials("admin").is_err());
        assert!(parse_credentials(":nopass").is_err());
    }

    #[test]
    fn sizes_format_human_readable() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(134217728), "128.00 MB");
    }
}
