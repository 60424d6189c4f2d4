//! Derives compose services, volumes, and networks from a compose file, and
//! generates the env-var names a per-worktree `.env` must parameterize
//! (§4.I).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

use crate::utils::command::run_command;

/// A single published port on a compose service, after parsing any of the
/// `"HOST:CONTAINER"` / `"PORT"` / object forms (§4.I).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// The host-side base port (the literal default for `${VAR:-N}` forms).
    pub base_port: u16,
    /// The container-side port.
    pub container_port: u16,
}

/// A compose service as derived by [`ComposeInspector::services`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeService {
    /// Compose-file service name.
    pub name: String,
    /// Ordered list of published ports, in file order.
    pub ports: Vec<PortSpec>,
    /// Volume mounts declared by the service.
    pub volumes: Vec<String>,
    /// Service keys this service `depends_on` (array or object form).
    pub depends_on: Vec<String>,
    /// Service keys this service `links` to (`"service"` or `"service:alias"`
    /// form; the alias is discarded).
    pub links: Vec<String>,
    /// `build.context`, if declared.
    pub build_context: Option<String>,
    /// `working_dir`, if declared.
    pub working_dir: Option<String>,
}

/// One allocatable port slot: its base (default host) port and the literal
/// or derived env-var name that parameterizes it, keyed by service key
/// (I-I1/I-I2). Used to drive port allocation and `.env` generation from the
/// same source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortVarSpec {
    /// The host-side default port declared in the compose file.
    pub base_port: u16,
    /// The env-var name that parameterizes this port.
    pub env_var: String,
}

/// A compose volume or network, with its `external` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedResource {
    /// Resource name.
    pub name: String,
    /// Whether it is declared `external: true`.
    pub external: bool,
}

/// Human-oriented rollup of a compose file's contents.
#[derive(Debug, Clone, Serialize)]
pub struct ComposeSummary {
    /// Number of services.
    pub service_count: usize,
    /// Total published ports across all services.
    pub port_count: usize,
    /// Number of declared volumes.
    pub volume_count: usize,
}

/// Errors surfaced by the inspector.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// `runtime config` exited non-zero; stderr is preserved verbatim
    /// (sanitized by the caller before it leaves the core).
    #[error("compose config failed: {stderr}")]
    ConfigFailed {
        /// Captured stderr from the runtime invocation.
        stderr: String,
    },
    /// The config output could not be parsed as YAML.
    #[error("failed to parse compose config output: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Underlying IO/process error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct CacheEntry {
    services: Vec<ComposeService>,
    volumes: Vec<NamedResource>,
    networks: Vec<NamedResource>,
    port_env_vars: BTreeMap<String, String>,
    port_specs: BTreeMap<String, PortVarSpec>,
}

/// Well-known alias table for second-and-later published ports of a
/// multi-port service (I-I1): `<service>-<suffix>`.
const KNOWN_SUFFIXES: &[(&str, &[&str])] = &[
    ("temporal", &["ui"]),
    ("minio", &["console"]),
    ("rabbitmq", &["management"]),
];

/// Inspects a compose file: shells out to the container runtime's `config`
/// subcommand for structural data, and separately regex-scans the raw file
/// text for the literal env-var names referenced in `ports:` blocks. A
/// process-wide cache, keyed by the compose file's absolute path, avoids
/// re-parsing within one process lifetime (§4.I).
pub struct ComposeInspector {
    runtime: String,
    cache: DashMap<PathBuf, Arc<CacheEntry>>,
}

impl ComposeInspector {
    /// Creates an inspector that shells out to `runtime` (e.g. `"docker"`)
    /// for `compose config`.
    #[must_use]
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            cache: DashMap::new(),
        }
    }

    /// Drops all cached entries; required for test hygiene and for
    /// diagnostics' "stale cache" check (§4.D).
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Returns every service defined by `compose_file`.
    ///
    /// # Errors
    /// Returns [`ComposeError::ConfigFailed`] if the runtime's `config`
    /// subcommand fails, or [`ComposeError::Parse`] if its output is not
    /// valid YAML.
    pub async fn services(&self, compose_file: &Path) -> Result<Vec<ComposeService>, ComposeError> {
        Ok(self.entry(compose_file).await?.services.clone())
    }

    /// Returns every top-level volume declared by `compose_file`.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn volumes(&self, compose_file: &Path) -> Result<Vec<NamedResource>, ComposeError> {
        Ok(self.entry(compose_file).await?.volumes.clone())
    }

    /// Returns every top-level network declared by `compose_file`.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn networks(&self, compose_file: &Path) -> Result<Vec<NamedResource>, ComposeError> {
        Ok(self.entry(compose_file).await?.networks.clone())
    }

    /// Returns the `serviceKey -> ENV_NAME` mapping discovered by scanning
    /// the raw compose file text for `${VAR:-default}` occurrences inside
    /// `ports:` blocks, so generated `.env` files parameterize the exact
    /// variable the compose file itself reads.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn port_env_vars(&self, compose_file: &Path) -> Result<BTreeMap<String, String>, ComposeError> {
        Ok(self.entry(compose_file).await?.port_env_vars.clone())
    }

    /// Returns the `serviceKey -> {basePort, envVar}` mapping used to drive
    /// port allocation (I-I1) from the same service keys [`Self::port_env_vars`]
    /// exposes, so allocated ports and generated `.env` lines always agree on
    /// which slot is which.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn port_specs(&self, compose_file: &Path) -> Result<BTreeMap<String, PortVarSpec>, ComposeError> {
        Ok(self.entry(compose_file).await?.port_specs.clone())
    }

    /// True if `compose_file` declares a service named `name`.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn has_service(&self, compose_file: &Path, name: &str) -> Result<bool, ComposeError> {
        Ok(self.entry(compose_file).await?.services.iter().any(|s| s.name == name))
    }

    /// A rollup summary of the file's contents.
    ///
    /// # Errors
    /// See [`Self::services`].
    pub async fn summary(&self, compose_file: &Path) -> Result<ComposeSummary, ComposeError> {
        let entry = self.entry(compose_file).await?;
        Ok(ComposeSummary {
            service_count: entry.services.len(),
            port_count: entry.services.iter().map(|s| s.ports.len()).sum(),
            volume_count: entry.volumes.len(),
        })
    }

    async fn entry(&self, compose_file: &Path) -> Result<Arc<CacheEntry>, ComposeError> {
        let key = compose_file
            .canonicalize()
            .unwrap_or_else(|_| compose_file.to_path_buf());

        if let Some(cached) = self.cache.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let raw_text = tokio::fs::read_to_string(compose_file)
            .await
            .map_err(|e| ComposeError::Other(anyhow::anyhow!(e)))?;

        let config_yaml = self.run_config(compose_file).await?;
        let doc: Value = serde_yaml::from_str(&config_yaml)?;

        let services = parse_services(&doc);
        let volumes = parse_named_resources(&doc, "volumes");
        let networks = parse_named_resources(&doc, "networks");
        let port_specs = scan_port_specs(&raw_text, &services);
        let port_env_vars = port_specs.iter().map(|(k, v)| (k.clone(), v.env_var.clone())).collect();

        let entry = Arc::new(CacheEntry {
            services,
            volumes,
            networks,
            port_env_vars,
            port_specs,
        });
        self.cache.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    async fn run_config(&self, compose_file: &Path) -> Result<String, ComposeError> {
        let file_arg = compose_file.to_string_lossy().into_owned();
        let output = run_command(&self.runtime, &["compose", "-f", &file_arg, "config"], None)
            .await
            .map_err(ComposeError::Other)?;
        if !output.success() {
            return Err(ComposeError::ConfigFailed { stderr: output.stderr });
        }
        debug!(compose_file = %compose_file.display(), "compose config resolved");
        Ok(output.stdout)
    }
}

fn parse_services(doc: &Value) -> Vec<ComposeService> {
    let Some(services_map) = doc.get("services").and_then(Value::as_mapping) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (name_value, spec) in services_map {
        let Some(name) = name_value.as_str() else { continue };
        let ports = spec
            .get("ports")
            .and_then(Value::as_sequence)
            .map(|seq| seq.iter().filter_map(parse_port_entry).collect())
            .unwrap_or_default();
        let volumes = spec
            .get("volumes")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let depends_on = spec.get("depends_on").map(parse_depends_on).unwrap_or_default();
        let links = spec
            .get("links")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.split_once(':').map_or(s, |(svc, _alias)| svc).to_owned())
                    .collect()
            })
            .unwrap_or_default();
        let build_context = spec
            .get("build")
            .and_then(|b| b.get("context").and_then(Value::as_str).or_else(|| b.as_str()))
            .map(str::to_owned);
        let working_dir = spec
            .get("working_dir")
            .and_then(Value::as_str)
            .map(str::to_owned);

        out.push(ComposeService {
            name: name.to_owned(),
            ports,
            volumes,
            depends_on,
            links,
            build_context,
            working_dir,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn parse_depends_on(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(seq) => seq.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect(),
        Value::Mapping(map) => map.keys().filter_map(|k| k.as_str().map(str::to_owned)).collect(),
        _ => Vec::new(),
    }
}

fn parse_port_entry(value: &Value) -> Option<PortSpec> {
    match value {
        Value::String(s) => parse_port_string(s),
        Value::Number(n) => {
            let p = n.as_u64()? as u16;
            Some(PortSpec { base_port: p, container_port: p })
        }
        Value::Mapping(_) => {
            let published = value.get("published").and_then(port_like)?;
            let target = value.get("target").and_then(port_like).unwrap_or(published);
            Some(PortSpec { base_port: published, container_port: target })
        }
        _ => None,
    }
}

fn port_like(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => Some(n.as_u64()? as u16),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_port_string(s: &str) -> Option<PortSpec> {
    // After `runtime compose config`, interpolation has already resolved
    // `${VAR:-N}` to its literal value, so the remaining shapes are plain
    // "HOST:CONTAINER" or "PORT".
    if let Some((host, container)) = s.split_once(':') {
        let host_port: u16 = host.rsplit(':').next()?.parse().ok()?;
        let container_port: u16 = container.parse().ok()?;
        Some(PortSpec { base_port: host_port, container_port })
    } else {
        let p: u16 = s.trim().parse().ok()?;
        Some(PortSpec { base_port: p, container_port: p })
    }
}

fn parse_named_resources(doc: &Value, key: &str) -> Vec<NamedResource> {
    let Some(map) = doc.get(key).and_then(Value::as_mapping) else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let name = k.as_str()?.to_owned();
            let external = v
                .get("external")
                .map(|e| matches!(e, Value::Bool(true)) || e.get("name").is_some())
                .unwrap_or(false);
            Some(NamedResource { name, external })
        })
        .collect()
}

fn env_var_ports_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\$\{([A-Z_][A-Z0-9_]*):-(\d+)\}\s*:\s*\d+"#).expect("valid regex")
    })
}

/// Known env-var alias table consulted when a port has no literal `${VAR}`
/// reference in the raw file (I-I2 fallback): `SERVICE_PORT` with `-` -> `_`
/// and uppercased, a handful of historical aliases.
fn derive_env_var_name(service: &str, suffix: Option<&str>) -> String {
    let base = match suffix {
        Some(suf) => format!("{service}_{suf}"),
        None => service.to_owned(),
    };
    format!("{}_PORT", base.to_uppercase().replace('-', "_"))
}

fn scan_port_specs(raw_text: &str, services: &[ComposeService]) -> BTreeMap<String, PortVarSpec> {
    // Map base_port -> literal env var name, discovered anywhere in the raw
    // text (the regex does not need to be scoped per-service since base
    // ports are unique within one compose file in practice).
    let mut literal_by_base_port: BTreeMap<u16, String> = BTreeMap::new();
    for caps in env_var_ports_re().captures_iter(raw_text) {
        let var_name = caps.get(1).expect("group 1").as_str().to_owned();
        if let Ok(default_port) = caps.get(2).expect("group 2").as_str().parse::<u16>() {
            literal_by_base_port.insert(default_port, var_name);
        }
    }

    let mut result = BTreeMap::new();
    for service in services {
        for (idx, port) in service.ports.iter().enumerate() {
            let suffix = if idx == 0 {
                None
            } else {
                known_suffix(&service.name, idx).or(Some(format!("port{}", idx + 1)))
            };
            let service_key = match &suffix {
                Some(s) if idx > 0 => format!("{}-{s}", service.name),
                _ => service.name.clone(),
            };
            let env_name = literal_by_base_port
                .get(&port.base_port)
                .cloned()
                .unwrap_or_else(|| derive_env_var_name(&service.name, suffix.as_deref()));
            result.insert(service_key, PortVarSpec { base_port: port.base_port, env_var: env_name });
        }
    }
    result
}

#[cfg(test)]
fn scan_port_env_vars(raw_text: &str, services: &[ComposeService]) -> BTreeMap<String, String> {
    scan_port_specs(raw_text, services)
        .into_iter()
        .map(|(k, v)| (k, v.env_var))
        .collect()
}

fn known_suffix(service: &str, index: usize) -> Option<String> {
    KNOWN_SUFFIXES
        .iter()
        .find(|(name, _)| *name == service)
        .and_then(|(_, suffixes)| suffixes.get(index - 1))
        .map(|s| (*s).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::host_container("3000:3000", Some(PortSpec { base_port: 3000, container_port: 3000 }))]
    #[case::remapped("8080:3000", Some(PortSpec { base_port: 8080, container_port: 3000 }))]
    #[case::bare_port("7233", Some(PortSpec { base_port: 7233, container_port: 7233 }))]
    #[case::not_a_port("not-a-port", None)]
    #[case::empty("", None)]
    fn parse_port_string_variants(#[case] input: &str, #[case] expected: Option<PortSpec>) {
        assert_eq!(parse_port_string(input), expected);
    }

    #[test]
    fn parse_services_folds_links_alongside_depends_on() {
        let raw = r#"
services:
  api:
    depends_on:
      - db
    links:
      - "cache:redis-alias"
  db: {}
  cache: {}
"#;
        let doc: Value = serde_yaml::from_str(raw).unwrap();
        let services = parse_services(&doc);
        let api = services.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.depends_on, vec!["db".to_owned()]);
        assert_eq!(api.links, vec!["cache".to_owned()]);
    }

    #[test]
    fn scan_port_env_vars_prefers_literal_names() {
        let raw = r#"
services:
  api:
    ports:
      - "${API_PORT:-3000}:3000"
"#;
        let services = vec![ComposeService {
            name: "api".into(),
            ports: vec![PortSpec { base_port: 3000, container_port: 3000 }],
            volumes: vec![],
            depends_on: vec![],
            links: vec![],
            build_context: None,
            working_dir: None,
        }];
        let map = scan_port_env_vars(raw, &services);
        assert_eq!(map.get("api"), Some(&"API_PORT".to_owned()));
    }

    #[test]
    fn scan_port_env_vars_falls_back_to_derived_name() {
        let services = vec![ComposeService {
            name: "my-service".into(),
            ports: vec![PortSpec { base_port: 9000, container_port: 9000 }],
            volumes: vec![],
            depends_on: vec![],
            links: vec![],
            build_context: None,
            working_dir: None,
        }];
        let map = scan_port_env_vars("", &services);
        assert_eq!(map.get("my-service"), Some(&"MY_SERVICE_PORT".to_owned()));
    }

    #[test]
    fn multi_port_service_uses_known_suffix_then_portn_fallback() {
        let services = vec![ComposeService {
            name: "temporal".into(),
            ports: vec![
                PortSpec { base_port: 7233, container_port: 7233 },
                PortSpec { base_port: 8233, container_port: 8233 },
            ],
            volumes: vec![],
            depends_on: vec![],
            links: vec![],
            build_context: None,
            working_dir: None,
        }];
        let map = scan_port_env_vars("", &services);
        assert_eq!(map.get("temporal"), Some(&"TEMPORAL_PORT".to_owned()));
        assert_eq!(map.get("temporal-ui"), Some(&"TEMPORAL_UI_PORT".to_owned()));
    }
}
