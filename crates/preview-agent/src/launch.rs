use std::{collections::BTreeMap, path::Path};

use crate::error::SessionError;

const VITE_CONFIG_EXTS: &[&str] = &["js", "mjs", "cjs", "ts", "mts", "cts"];

/// How the dev server for a workspace is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Vite,
    StartScript,
    DevScript,
    /// Neither a vite config nor a recognized script; defer to the package manager.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub kind: ProjectKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchPlan {
    pub fn display_command(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

#[derive(Debug, serde::Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

fn has_vite_config(workspace: &Path) -> bool {
    VITE_CONFIG_EXTS
        .iter()
        .any(|ext| workspace.join(format!("vite.config.{ext}")).is_file())
}

pub async fn detect_project_kind(workspace: &Path) -> Result<ProjectKind, SessionError> {
    if has_vite_config(workspace) {
        return Ok(ProjectKind::Vite);
    }

    let manifest_path = workspace.join("package.json");
    let raw = match tokio::fs::read(&manifest_path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProjectKind::Default),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("read {}", manifest_path.display()))
                .into());
        }
    };

    let manifest: PackageManifest =
        serde_json::from_slice(&raw).map_err(|e| SessionError::StartFailed {
            message: format!("package.json is not valid JSON: {e}"),
            stderr_excerpt: String::new(),
        })?;

    Ok(if manifest.scripts.contains_key("start") {
        ProjectKind::StartScript
    } else if manifest.scripts.contains_key("dev") {
        ProjectKind::DevScript
    } else {
        ProjectKind::Default
    })
}

fn pm_args(kind: ProjectKind, port: u16) -> Vec<String> {
    let port = port.to_string();
    let args: Vec<&str> = match kind {
        ProjectKind::Vite => vec![
            "exec",
            "--",
            "vite",
            "--port",
            port.as_str(),
            "--host",
            "0.0.0.0",
            "--strictPort",
        ],
        ProjectKind::StartScript => vec!["run", "start"],
        ProjectKind::DevScript => vec!["run", "dev"],
        ProjectKind::Default => vec!["start"],
    };
    args.into_iter().map(str::to_string).collect()
}

/// The run step for `workspace` listening on `port`.
pub async fn plan_run(
    workspace: &Path,
    package_manager: &str,
    port: u16,
    extra_env: &BTreeMap<String, String>,
) -> Result<LaunchPlan, SessionError> {
    let kind = detect_project_kind(workspace).await?;

    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), port.to_string());
    env.insert("HOST".to_string(), "0.0.0.0".to_string());
    env.insert("BROWSER".to_string(), "none".to_string());
    // Caller-supplied values win.
    for (k, v) in extra_env {
        env.insert(k.clone(), v.clone());
    }

    Ok(LaunchPlan {
        kind,
        program: package_manager.to_string(),
        args: pm_args(kind, port),
        env,
    })
}

pub fn plan_install(package_manager: &str) -> LaunchPlan {
    LaunchPlan {
        kind: ProjectKind::Default,
        program: package_manager.to_string(),
        args: vec!["install".to_string()],
        env: BTreeMap::new(),
    }
}

/// Builds the OS command for a plan. On Windows package managers are `.cmd` shims and
/// have to go through `cmd /C`.
pub fn command_for(plan: &LaunchPlan, cwd: &Path) -> tokio::process::Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(&plan.program).args(&plan.args);
        c
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut c = tokio::process::Command::new(&plan.program);
        c.args(&plan.args);
        c
    };

    cmd.current_dir(cwd).envs(&plan.env).kill_on_drop(true);
    cmd
}
