//! `PackageApi` implemented by driving the `helm` binary.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{PackageApi, PackageRef};
use crate::error::PackageError;

/// Options for invoking helm.
#[derive(Debug, Clone)]
pub struct HelmOptions {
    pub bin: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Upper bound for a single helm invocation.
    pub timeout: Duration,
    /// Destination for `helm pull` during preload.
    pub cache_dir: PathBuf,
}

impl Default for HelmOptions {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("helm"),
            kubeconfig: None,
            context: None,
            timeout: Duration::from_secs(600),
            cache_dir: std::env::temp_dir().join("kstack-charts"),
        }
    }
}

/// Helm CLI wrapper.
pub struct HelmCli {
    options: HelmOptions,
}

impl HelmCli {
    pub fn new(options: HelmOptions) -> Self {
        Self { options }
    }

    /// Flags selecting the target cluster.
    fn cluster_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.options.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        if let Some(context) = &self.options.context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        args
    }

    /// Run helm with `args` and return stdout.
    async fn run(&self, args: Vec<String>) -> Result<String, PackageError> {
        let label = format!("helm {}", args.first().map_or("", String::as_str));
        let mut cmd = Command::new(&self.options.bin);
        cmd.args(&args).args(self.cluster_args()).kill_on_drop(true);

        debug!("Running: {} {}", self.options.bin.display(), args.join(" "));

        let output = tokio::time::timeout(self.options.timeout, cmd.output())
            .await
            .map_err(|_| PackageError::CommandTimeout {
                command: label.clone(),
                timeout: self.options.timeout,
            })?
            .map_err(|e| PackageError::Command {
                command: label.clone(),
                message: format!(
                    "failed to execute {}: {}. Is helm installed?",
                    self.options.bin.display(),
                    e
                ),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PackageError::Command {
                command: label,
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Arguments for `helm install` / `helm upgrade`.
fn release_args(verb: &str, package: &PackageRef) -> Vec<String> {
    let mut args = vec![
        verb.to_string(),
        package.name.clone(),
        package.chart.clone(),
        "--namespace".to_string(),
        package.namespace.clone(),
        "--version".to_string(),
        package.version.clone(),
    ];
    if verb == "install" {
        args.push("--create-namespace".to_string());
    }
    for overlay in &package.overlays {
        args.push("-f".to_string());
        args.push(overlay.display().to_string());
    }
    args
}

/// Interpret `helm history -o json` output.
fn parse_history(stdout: &str) -> Result<bool, PackageError> {
    let revisions: Vec<serde_json::Value> =
        serde_json::from_str(stdout.trim()).map_err(|e| PackageError::Output {
            command: "helm history".to_string(),
            message: e.to_string(),
        })?;
    Ok(!revisions.is_empty())
}

#[async_trait]
impl PackageApi for HelmCli {
    async fn has_history(&self, name: &str, namespace: &str) -> Result<bool, PackageError> {
        let args = vec![
            "history".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--max".to_string(),
            "1".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];

        match self.run(args).await {
            Ok(stdout) => parse_history(&stdout),
            Err(PackageError::Command { message, .. }) if message.contains("release: not found") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, package: &PackageRef) -> Result<(), PackageError> {
        self.run(release_args("install", package)).await.map(|_| ())
    }

    async fn upgrade(&self, package: &PackageRef) -> Result<(), PackageError> {
        self.run(release_args("upgrade", package)).await.map(|_| ())
    }

    async fn prefetch(&self, package: &PackageRef) -> Result<(), PackageError> {
        tokio::fs::create_dir_all(&self.options.cache_dir)
            .await
            .map_err(|e| PackageError::Command {
                command: "helm pull".to_string(),
                message: format!(
                    "failed to create {}: {}",
                    self.options.cache_dir.display(),
                    e
                ),
            })?;

        let args = vec![
            "pull".to_string(),
            package.chart.clone(),
            "--version".to_string(),
            package.version.clone(),
            "--destination".to_string(),
            self.options.cache_dir.display().to_string(),
        ];
        self.run(args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> PackageRef {
        PackageRef {
            name: "kstack-core".to_string(),
            chart: "oci://ghcr.io/kstack/charts/kstack-core".to_string(),
            namespace: "kstack".to_string(),
            version: "1.4.0".to_string(),
            overlays: vec![PathBuf::from("/values/core.yaml")],
        }
    }

    #[test]
    fn test_install_args() {
        assert_eq!(
            release_args("install", &package()),
            vec![
                "install",
                "kstack-core",
                "oci://ghcr.io/kstack/charts/kstack-core",
                "--namespace",
                "kstack",
                "--version",
                "1.4.0",
                "--create-namespace",
                "-f",
                "/values/core.yaml",
            ]
        );
    }

    #[test]
    fn test_upgrade_args_keep_overlays() {
        let args = release_args("upgrade", &package());
        assert_eq!(args[0], "upgrade");
        assert!(!args.contains(&"--create-namespace".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-f", "/values/core.yaml"]);
    }

    #[test]
    fn test_parse_history() {
        assert!(parse_history(r#"[{"revision":1,"status":"deployed"}]"#).unwrap());
        assert!(!parse_history("[]\n").unwrap());
        assert!(matches!(
            parse_history("Error: boom"),
            Err(PackageError::Output { .. })
        ));
    }

    #[test]
    fn test_cluster_args() {
        let helm = HelmCli::new(HelmOptions {
            kubeconfig: Some(PathBuf::from("/tmp/kubeconfig")),
            context: Some("kind-kstack".to_string()),
            ..HelmOptions::default()
        });
        assert_eq!(
            helm.cluster_args(),
            vec!["--kubeconfig", "/tmp/kubeconfig", "--kube-context", "kind-kstack"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_error() {
        let helm = HelmCli::new(HelmOptions {
            bin: PathBuf::from("/nonexistent/helm-binary"),
            ..HelmOptions::default()
        });
        let err = helm.install(&package()).await.unwrap_err();
        assert!(matches!(err, PackageError::Command { .. }));
        assert!(err.to_string().contains("Is helm installed?"));
    }
}
