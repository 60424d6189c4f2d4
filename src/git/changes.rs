//! Classifies a commit's changed files to decide what must be reloaded
//! (`ChangeDetector.analyze`, §4.G), and computes a topological service
//! restart order from the compose dependency graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::compose::ComposeService;

/// Sentinel meaning "every service must be considered affected" (GLOSSARY).
pub const ALL_SERVICES: &str = "_all_";

/// Result of [`ChangeDetector::analyze`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeAnalysis {
    /// At least one changed file is service-affecting (compose/Dockerfile).
    pub needs_service_restart: bool,
    /// At least one changed file is a dependency manifest.
    pub needs_dependency_install: bool,
    /// Migration files touched, with their count.
    pub migrations: Vec<String>,
    /// Services affected; contains [`ALL_SERVICES`] when any file matches
    /// the service-affecting set or lives under `packages/`.
    pub affected_services: BTreeSet<String>,
    /// Every changed file path, verbatim.
    pub changed_files: Vec<String>,
    /// Categorized summary, keyed by category name (`"source"`, `"config"`,
    /// `"migration"`, `"dependency"`).
    pub summary: HashMap<String, Vec<String>>,
}

fn service_affecting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(docker-compose\.ya?ml|compose\.ya?ml|podman-compose\.ya?ml|docker-compose\..+\.ya?ml|Dockerfile(\..+)?|\.env.*)$")
            .expect("valid regex")
    })
}

fn migration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|/)(migrations/|db/migrate/|database/migrations/|prisma/migrations/|alembic/versions/)|\.migration\.")
            .expect("valid regex")
    })
}

const DEPENDENCY_MANIFESTS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "requirements.txt",
    "Pipfile",
    "pyproject.toml",
    "Gemfile",
    "Gemfile.lock",
    "go.mod",
    "go.sum",
    "Cargo.toml",
    "Cargo.lock",
    "composer.json",
    "composer.lock",
];

/// Stateless analyzer over a list of changed file paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Classifies `changed_files` (already flattened from the commit list
    /// the caller resolved), consulting `services` to match each file
    /// against a service's `build.context`/`working_dir` in addition to the
    /// `services/<n>` / `apps/<n>` path-prefix convention.
    ///
    /// `_all_` semantics (pinned per the Open Question in spec.md §9): when
    /// any file is service-affecting or lives under `packages/`, the
    /// sentinel is added and *short-circuits* — no other per-path service
    /// names are computed for that analysis, since "every service" already
    /// subsumes any more specific match. This mirrors the "short-circuit"
    /// code path noted as the ambiguity; the "merge" code path is not
    /// reproduced, since a caller can always special-case `_all_` cheaply
    /// but cannot recover which specific services would have matched once
    /// they've been merged away.
    #[must_use]
    pub fn analyze(changed_files: &[String], services: &[ComposeService]) -> ChangeAnalysis {
        let mut analysis = ChangeAnalysis {
            changed_files: changed_files.to_vec(),
            ..Default::default()
        };
        if changed_files.is_empty() {
            return analysis;
        }

        let mut source_files = Vec::new();
        let mut config_files = Vec::new();
        let mut dependency_files = Vec::new();
        let mut migration_files = Vec::new();
        let mut sees_all = false;
        let mut per_path_services: BTreeSet<String> = BTreeSet::new();

        for file in changed_files {
            let basename = file.rsplit('/').next().unwrap_or(file);

            if service_affecting_re().is_match(basename) {
                analysis.needs_service_restart = true;
                sees_all = true;
                config_files.push(file.clone());
                continue;
            }
            if file.starts_with("packages/") {
                sees_all = true;
            }
            if migration_re().is_match(file) {
                migration_files.push(file.clone());
                continue;
            }
            if DEPENDENCY_MANIFESTS.contains(&basename) {
                analysis.needs_dependency_install = true;
                dependency_files.push(file.clone());
                continue;
            }

            if let Some(service) = path_prefix_service(file) {
                per_path_services.insert(service);
            } else {
                for svc in services {
                    if let Some(ctx) = &svc.build_context
                        && file.starts_with(ctx.trim_start_matches("./"))
                    {
                        per_path_services.insert(svc.name.clone());
                    }
                    if let Some(wd) = &svc.working_dir
                        && file.starts_with(wd.trim_start_matches('/'))
                    {
                        per_path_services.insert(svc.name.clone());
                    }
                }
            }

            source_files.push(file.clone());
        }

        analysis.migrations = migration_files.clone();

        if sees_all {
            analysis.affected_services.insert(ALL_SERVICES.to_owned());
        } else {
            analysis.affected_services = per_path_services;
        }

        analysis.summary.insert("source".to_owned(), source_files);
        analysis.summary.insert("config".to_owned(), config_files);
        analysis.summary.insert("migration".to_owned(), migration_files);
        analysis.summary.insert("dependency".to_owned(), dependency_files);

        analysis
    }

    /// Builds a DAG from compose `depends_on` and `links` (both imply the
    /// same ordering edge: the declaring service must come after the one it
    /// names) and topologically sorts it into batches (each batch mutually
    /// independent, suitable for restarting in parallel). On cycle
    /// detection, the remaining unsortable nodes are emitted as one final
    /// batch rather than erroring, since a restart still has to make
    /// progress. When `subset` contains [`ALL_SERVICES`] (or is empty),
    /// every service is included; otherwise the graph is filtered to
    /// `subset` before sorting.
    #[must_use]
    pub fn restart_order(services: &[ComposeService], subset: &[String]) -> Vec<Vec<String>> {
        let include_all = subset.is_empty() || subset.iter().any(|s| s == ALL_SERVICES);
        let wanted: HashSet<&str> = if include_all {
            services.iter().map(|s| s.name.as_str()).collect()
        } else {
            subset.iter().map(String::as_str).collect()
        };

        let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for svc in services {
            if !wanted.contains(svc.name.as_str()) {
                continue;
            }
            indegree.entry(svc.name.as_str()).or_insert(0);
            for dep in svc.depends_on.iter().chain(&svc.links) {
                if wanted.contains(dep.as_str()) {
                    deps.entry(dep.as_str()).or_default().push(&svc.name);
                    *indegree.entry(svc.name.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut batches = Vec::new();
        let mut remaining: HashSet<&str> = wanted.clone();
        let mut current_indegree = indegree.clone();

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|n| current_indegree.get(n).copied().unwrap_or(0) == 0)
                .collect();

            if ready.is_empty() {
                // Cycle: dump everything left as one final batch.
                let mut rest: Vec<String> = remaining.iter().map(|s| (*s).to_owned()).collect();
                rest.sort();
                batches.push(rest);
                break;
            }

            let mut batch: Vec<String> = ready.iter().map(|s| (*s).to_owned()).collect();
            batch.sort();
            batches.push(batch);

            for node in &ready {
                remaining.remove(node);
                if let Some(dependents) = deps.get(node) {
                    for dependent in dependents {
                        if let Some(d) = current_indegree.get_mut(dependent) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
        }

        batches
    }
}

fn path_prefix_service(file: &str) -> Option<String> {
    for prefix in ["services/", "apps/"] {
        if let Some(rest) = file.strip_prefix(prefix) {
            let name = rest.split('/').next()?;
            if !name.is_empty() {
                return Some(name.to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, depends_on: &[&str]) -> ComposeService {
        svc_with_links(name, depends_on, &[])
    }

    fn svc_with_links(name: &str, depends_on: &[&str], links: &[&str]) -> ComposeService {
        ComposeService {
            name: name.to_owned(),
            ports: vec![],
            volumes: vec![],
            depends_on: depends_on.iter().map(|s| (*s).to_owned()).collect(),
            links: links.iter().map(|s| (*s).to_owned()).collect(),
            build_context: None,
            working_dir: None,
        }
    }

    #[test]
    fn empty_commit_list_returns_zeroed_fields() {
        let analysis = ChangeDetector::analyze(&[], &[]);
        assert!(!analysis.needs_service_restart);
        assert!(!analysis.needs_dependency_install);
        assert!(analysis.migrations.is_empty());
        assert!(!analysis.affected_services.contains(ALL_SERVICES));
    }

    #[test]
    fn compose_and_package_files_trigger_restart_and_dependency_install() {
        let files = vec![
            "docker-compose.yml".to_owned(),
            "package.json".to_owned(),
            "migrations/001.sql".to_owned(),
            "src/app.js".to_owned(),
        ];
        let analysis = ChangeDetector::analyze(&files, &[]);
        assert!(analysis.needs_service_restart);
        assert!(analysis.needs_dependency_install);
        assert_eq!(analysis.migrations.len(), 1);
        assert_eq!(analysis.summary.get("source").unwrap(), &vec!["src/app.js".to_owned()]);
        assert!(analysis.affected_services.contains(ALL_SERVICES));
    }

    #[test]
    fn packages_prefix_implies_all_sentinel() {
        let files = vec!["packages/shared/util.ts".to_owned()];
        let analysis = ChangeDetector::analyze(&files, &[]);
        assert!(analysis.affected_services.contains(ALL_SERVICES));
    }

    #[test]
    fn service_path_prefix_maps_without_all_sentinel() {
        let files = vec!["services/api/main.go".to_owned()];
        let analysis = ChangeDetector::analyze(&files, &[]);
        assert!(!analysis.affected_services.contains(ALL_SERVICES));
        assert!(analysis.affected_services.contains("api"));
    }

    #[test]
    fn topological_restart_order_respects_depends_on() {
        let services = vec![
            svc("api", &["db"]),
            svc("worker", &["db", "redis"]),
            svc("db", &[]),
            svc("redis", &[]),
        ];
        let batches = ChangeDetector::restart_order(&services, &[ALL_SERVICES.to_owned()]);
        let flat: Vec<&str> = batches.iter().flatten().map(String::as_str).collect();

        let pos = |name: &str| flat.iter().position(|n| *n == name).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("db") < pos("worker"));
        assert!(pos("redis") < pos("worker"));
    }

    #[test]
    fn restart_order_respects_links_same_as_depends_on() {
        let services = vec![svc_with_links("api", &[], &["cache"]), svc("cache", &[])];
        let batches = ChangeDetector::restart_order(&services, &[ALL_SERVICES.to_owned()]);
        let flat: Vec<&str> = batches.iter().flatten().map(String::as_str).collect();
        assert!(flat.iter().position(|n| *n == "cache").unwrap() < flat.iter().position(|n| *n == "api").unwrap());
    }

    #[test]
    fn restart_order_handles_cycle_without_hanging() {
        let services = vec![svc("a", &["b"]), svc("b", &["a"])];
        let batches = ChangeDetector::restart_order(&services, &[ALL_SERVICES.to_owned()]);
        let flat: Vec<&str> = batches.iter().flatten().map(String::as_str).collect();
        assert_eq!(flat.len(), 2);
    }

    #[test]
    fn restart_order_filters_to_subset_before_sorting() {
        let services = vec![svc("api", &["db"]), svc("db", &[]), svc("unrelated", &[])];
        let batches = ChangeDetector::restart_order(&services, &["api".to_owned(), "db".to_owned()]);
        let flat: Vec<&str> = batches.iter().flatten().map(String::as_str).collect();
        assert!(!flat.contains(&"unrelated"));
    }
}
