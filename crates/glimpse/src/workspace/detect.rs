//! Package manager and framework detection.
//!
//! Everything here is derived from the cloned tree: the lockfile picks the
//! package manager, the dependency tables pick the framework, and the
//! manifest's scripts pick the start command. Arbitrary user-supplied
//! commands are never accepted.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;

/// Package managers the orchestrator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Argv prefix for running a manifest script.
    pub fn run_prefix(&self) -> Vec<String> {
        match self {
            PackageManager::Npm => vec!["npm".to_string(), "run".to_string()],
            PackageManager::Yarn => vec!["yarn".to_string()],
            PackageManager::Pnpm => vec!["pnpm".to_string()],
        }
    }

    /// Argv for installing dependencies.
    ///
    /// Plain install rather than ci/frozen-lockfile: previewed trees often
    /// carry a manifest edited without a lockfile refresh.
    pub fn install_command(&self) -> Vec<String> {
        match self {
            PackageManager::Npm => vec!["npm".to_string(), "install".to_string()],
            PackageManager::Yarn => vec!["yarn".to_string(), "install".to_string()],
            PackageManager::Pnpm => vec!["pnpm".to_string(), "install".to_string()],
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageManager::Npm => write!(f, "npm"),
            PackageManager::Yarn => write!(f, "yarn"),
            PackageManager::Pnpm => write!(f, "pnpm"),
        }
    }
}

/// Relevant parts of a parsed `package.json`.
#[derive(Debug, Clone, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(default)]
    dependencies: HashMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, String>,
}

/// Detected package manager and manifest contents.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub manager: PackageManager,
    pub lockfile: Option<String>,
    pub scripts: HashMap<String, String>,
    pub dependencies: HashMap<String, String>,
    pub dev_dependencies: HashMap<String, String>,
}

/// Detect the package manager from the manifest and lockfiles.
///
/// Returns `Ok(None)` when there is no parseable `package.json` — the tree
/// is not a Node project the orchestrator can serve.
pub fn detect_package_manager(workspace_path: &Path) -> Result<Option<PackageInfo>> {
    let manifest_path = workspace_path.join("package.json");
    if !manifest_path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let manifest: Manifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("Failed to parse package.json: {}", e);
            return Ok(None);
        }
    };

    // Lockfile priority: pnpm > yarn > npm, npm as the default.
    let (manager, lockfile) = if workspace_path.join("pnpm-lock.yaml").exists() {
        (PackageManager::Pnpm, Some("pnpm-lock.yaml".to_string()))
    } else if workspace_path.join("yarn.lock").exists() {
        (PackageManager::Yarn, Some("yarn.lock".to_string()))
    } else if workspace_path.join("package-lock.json").exists() {
        (PackageManager::Npm, Some("package-lock.json".to_string()))
    } else {
        (PackageManager::Npm, None)
    };

    Ok(Some(PackageInfo {
        manager,
        lockfile,
        scripts: manifest.scripts,
        dependencies: manifest.dependencies,
        dev_dependencies: manifest.dev_dependencies,
    }))
}

/// Frameworks checked in priority order against the union of production and
/// dev dependencies. Vite wins outright since it determines dev-server
/// behavior; meta-frameworks beat plain UI libraries.
const FRAMEWORK_INDICATORS: &[(&str, &str)] = &[
    ("next", "nextjs"),
    ("nuxt", "nuxt"),
    ("@sveltejs/kit", "sveltekit"),
    ("@angular/cli", "angular"),
    ("svelte", "svelte"),
    ("vue", "vue"),
    ("@angular/core", "angular"),
    ("react", "react"),
];

/// Detect the frontend framework from the dependency tables.
pub fn detect_framework(package_info: &PackageInfo) -> Option<String> {
    let has_dep = |name: &str| {
        package_info.dependencies.contains_key(name)
            || package_info.dev_dependencies.contains_key(name)
    };

    if has_dep("vite") {
        return Some("vite".to_string());
    }

    for (dep, framework) in FRAMEWORK_INDICATORS {
        if has_dep(dep) {
            return Some((*framework).to_string());
        }
    }

    None
}

/// Choose the dev-server start command.
///
/// Prefers well-known manifest scripts by name, then falls back to a direct
/// per-framework invocation.
pub fn start_command(package_info: &PackageInfo, framework: Option<&str>) -> Vec<String> {
    let run_prefix = package_info.manager.run_prefix();
    let scripts = &package_info.scripts;

    // Next.js `start` is the production server; keep it off the list.
    let preferred: &[&str] = if framework == Some("nextjs") {
        &["dev", "start"]
    } else {
        &["dev", "start", "serve", "preview"]
    };

    for name in preferred {
        if scripts.contains_key(*name) {
            let mut argv = run_prefix.clone();
            argv.push((*name).to_string());
            return argv;
        }
    }

    let direct: &[(&str, &[&str])] = &[
        ("vite", &["npx", "vite", "--host"]),
        ("nextjs", &["npx", "next", "dev"]),
        ("react", &["npx", "react-scripts", "start"]),
    ];
    if let Some(framework) = framework {
        for (name, argv) in direct {
            if *name == framework {
                return argv.iter().map(|s| s.to_string()).collect();
            }
        }
    }

    vec!["npm".to_string(), "start".to_string()]
}
