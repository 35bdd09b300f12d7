//! Environment facts the stage selector works from.
//!
//! `EnvSnapshot::detect` probes the running host. Every probe is best effort:
//! a missing tool or a timeout leaves the corresponding field unknown rather
//! than failing. The parsing helpers are pure so they can be tested without
//! the tools installed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

const SNAPSHOT_TARGET: &str = "chrome_troubleshooter::snapshot";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

impl GpuVendor {
    /// Vendors with a dedicated video-acceleration mitigation stage.
    pub fn is_known(self) -> bool {
        !matches!(self, GpuVendor::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
            GpuVendor::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayProtocol {
    X11,
    Wayland,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessControlKind {
    Selinux,
    Apparmor,
}

/// Mandatory access control subsystem and whether it is actively enforcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    pub kind: AccessControlKind,
    pub enforcing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    Docker,
    Podman,
    Flatpak,
    Snap,
    /// Some other container announced through the `container` variable.
    Container,
}

/// What the host looks like, as far as launch flags are concerned.
///
/// Unknown facts stay `None` and never trigger a stage on their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    #[serde(default)]
    pub gpu_vendor: Option<GpuVendor>,
    /// `Some(false)` only when a probe ran and found no usable VA-API driver.
    #[serde(default)]
    pub vaapi_driver_present: Option<bool>,
    #[serde(default)]
    pub display_protocol: DisplayProtocol,
    #[serde(default)]
    pub access_control: Option<AccessControl>,
    #[serde(default)]
    pub sandbox_runtime: Option<SandboxRuntime>,
}

impl EnvSnapshot {
    /// Probe the current host.
    pub async fn detect() -> Self {
        let lspci = run_probe("lspci", &[]).await;
        let vainfo = run_probe("vainfo", &[]).await;
        let getenforce = run_probe("getenforce", &[]).await;

        let env = |key: &str| std::env::var(key).ok();

        let access_control = getenforce
            .as_deref()
            .and_then(parse_getenforce)
            .or_else(detect_apparmor);

        let snapshot = Self {
            gpu_vendor: lspci.as_deref().and_then(parse_gpu_vendor),
            vaapi_driver_present: vainfo.as_deref().map(parse_vainfo),
            display_protocol: parse_display_protocol(
                env("XDG_SESSION_TYPE").as_deref(),
                env("WAYLAND_DISPLAY").as_deref(),
                env("DISPLAY").as_deref(),
            ),
            access_control,
            sandbox_runtime: detect_sandbox_runtime(env, |p| Path::new(p).exists()),
        };
        debug!(target: SNAPSHOT_TARGET, ?snapshot, "environment detected");
        snapshot
    }

    /// Load a snapshot previously saved as JSON.
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

/// Run a probe command and return its combined output, or `None` if it could
/// not run, timed out, or exited non-zero with no output.
async fn run_probe(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            if !output.status.success() && text.trim().is_empty() {
                return None;
            }
            Some(text)
        }
        Ok(Err(error)) => {
            debug!(target: SNAPSHOT_TARGET, program, %error, "probe unavailable");
            None
        }
        Err(_) => {
            debug!(target: SNAPSHOT_TARGET, program, "probe timed out");
            None
        }
    }
}

/// Pick the GPU vendor from `lspci` output, preferring display-class lines.
pub fn parse_gpu_vendor(lspci: &str) -> Option<GpuVendor> {
    let display_lines: Vec<String> = lspci
        .lines()
        .map(str::to_lowercase)
        .filter(|line| {
            line.contains("vga compatible")
                || line.contains("3d controller")
                || line.contains("display controller")
        })
        .collect();

    if display_lines.is_empty() {
        return None;
    }

    let text = display_lines.join("\n");
    if text.contains("nvidia") {
        Some(GpuVendor::Nvidia)
    } else if text.contains("amd") || text.contains("radeon") || text.contains(" ati ") {
        Some(GpuVendor::Amd)
    } else if text.contains("intel") {
        Some(GpuVendor::Intel)
    } else {
        Some(GpuVendor::Other)
    }
}

/// Whether `vainfo` reports a working driver.
pub fn parse_vainfo(output: &str) -> bool {
    if output.contains("vaInitialize failed") {
        return false;
    }
    output.contains("Driver version") || output.contains("VAProfile")
}

pub fn parse_display_protocol(
    session_type: Option<&str>,
    wayland_display: Option<&str>,
    x_display: Option<&str>,
) -> DisplayProtocol {
    match session_type.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("wayland") => return DisplayProtocol::Wayland,
        Some("x11") => return DisplayProtocol::X11,
        _ => {}
    }
    if wayland_display.is_some_and(|d| !d.is_empty()) {
        DisplayProtocol::Wayland
    } else if x_display.is_some_and(|d| !d.is_empty()) {
        DisplayProtocol::X11
    } else {
        DisplayProtocol::Unknown
    }
}

/// Interpret `getenforce` output. `Disabled` means no SELinux at all.
pub fn parse_getenforce(output: &str) -> Option<AccessControl> {
    match output.trim().to_lowercase().as_str() {
        "enforcing" => Some(AccessControl {
            kind: AccessControlKind::Selinux,
            enforcing: true,
        }),
        "permissive" => Some(AccessControl {
            kind: AccessControlKind::Selinux,
            enforcing: false,
        }),
        _ => None,
    }
}

/// AppArmor counts as enforcing for the browser when it restricts
/// unprivileged user namespaces, which the browser sandbox depends on.
fn detect_apparmor() -> Option<AccessControl> {
    let enabled = std::fs::read_to_string("/sys/module/apparmor/parameters/enabled").ok()?;
    if !enabled.trim().eq_ignore_ascii_case("y") {
        return None;
    }
    let restrict =
        std::fs::read_to_string("/proc/sys/kernel/apparmor_restrict_unprivileged_userns")
            .unwrap_or_default();
    Some(AccessControl {
        kind: AccessControlKind::Apparmor,
        enforcing: restrict.trim() == "1",
    })
}

/// Identify a container or application sandbox from the environment and
/// well-known marker files.
pub fn detect_sandbox_runtime<E, X>(env: E, exists: X) -> Option<SandboxRuntime>
where
    E: Fn(&str) -> Option<String>,
    X: Fn(&str) -> bool,
{
    if env("FLATPAK_ID").is_some() || exists("/.flatpak-info") {
        Some(SandboxRuntime::Flatpak)
    } else if env("SNAP").is_some() {
        Some(SandboxRuntime::Snap)
    } else if exists("/.dockerenv") {
        Some(SandboxRuntime::Docker)
    } else if exists("/run/.containerenv") {
        Some(SandboxRuntime::Podman)
    } else if env("container").is_some_and(|v| !v.is_empty()) {
        Some(SandboxRuntime::Container)
    } else {
        None
    }
}
