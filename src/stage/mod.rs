//! Fallback stages and the rules that order them.
//!
//! `select` is a pure function of an [`EnvSnapshot`]: the same snapshot always
//! yields the same list, in the same order, with the same flags. The list is
//! built once per session and never changes while attempts run.
//!
//! | Order | Stage              | When                                        |
//! |-------|--------------------|---------------------------------------------|
//! | 1     | `vanilla`          | always                                      |
//! | 2     | `<vendor>_vaapi`   | known GPU vendor and VA-API driver missing  |
//! | 3     | `no_gpu`           | always                                      |
//! | 4     | `x11_compat`       | Wayland session                             |
//! | 5     | `mac_compat`       | SELinux/AppArmor enforcing                  |
//! | 6     | `container_compat` | container or app sandbox                    |
//! | 7     | `safe_mode`        | always, last                                |

pub mod snapshot;

use serde::{Deserialize, Serialize};

pub use snapshot::{
    AccessControl, AccessControlKind, DisplayProtocol, EnvSnapshot, GpuVendor, SandboxRuntime,
};

/// One fallback launch strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub description: String,
    pub flags: Vec<String>,
}

impl Stage {
    fn new(name: &str, description: &str, flags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub const VANILLA: &str = "vanilla";
pub const NO_GPU: &str = "no_gpu";
pub const X11_COMPAT: &str = "x11_compat";
pub const MAC_COMPAT: &str = "mac_compat";
pub const CONTAINER_COMPAT: &str = "container_compat";
pub const SAFE_MODE: &str = "safe_mode";

/// Build the ordered stage list for `snapshot`.
pub fn select(snapshot: &EnvSnapshot) -> Vec<Stage> {
    let mut stages = vec![Stage::new(VANILLA, "Default launch with no extra flags", &[])];

    if let Some(vendor) = snapshot.gpu_vendor
        && vendor.is_known()
        && snapshot.vaapi_driver_present == Some(false)
    {
        stages.push(vaapi_mitigation(vendor));
    }

    stages.push(Stage::new(
        NO_GPU,
        "Disable hardware acceleration",
        &["--disable-gpu", "--disable-gpu-compositing"],
    ));

    if snapshot.display_protocol == DisplayProtocol::Wayland {
        stages.push(Stage::new(
            X11_COMPAT,
            "Force the X11 backend through XWayland",
            &["--ozone-platform=x11", "--disable-features=UseOzonePlatform"],
        ));
    }

    if snapshot.access_control.is_some_and(|mac| mac.enforcing) {
        stages.push(Stage::new(
            MAC_COMPAT,
            "Relax sandbox layers blocked by the access-control policy",
            &["--disable-seccomp-filter-sandbox", "--disable-setuid-sandbox"],
        ));
    }

    if snapshot.sandbox_runtime.is_some() {
        stages.push(Stage::new(
            CONTAINER_COMPAT,
            "Disable the OS sandbox and /dev/shm inside a container",
            &["--no-sandbox", "--disable-dev-shm-usage"],
        ));
    }

    stages.push(Stage::new(
        SAFE_MODE,
        "Minimal launch: no acceleration, no sandbox, no extensions",
        &[
            "--disable-gpu",
            "--disable-gpu-compositing",
            "--no-sandbox",
            "--disable-extensions",
            "--disable-component-extensions-with-background-pages",
            "--incognito",
        ],
    ));

    stages
}

/// `select`, capped to `max_attempts` stages.
pub fn plan(snapshot: &EnvSnapshot, max_attempts: usize) -> Vec<Stage> {
    let mut stages = select(snapshot);
    stages.truncate(max_attempts);
    stages
}

fn vaapi_mitigation(vendor: GpuVendor) -> Stage {
    let flags: &[&str] = match vendor {
        GpuVendor::Nvidia => &[
            "--disable-features=VaapiVideoDecoder,VaapiVideoEncoder",
            "--disable-gpu-memory-buffer-video-frames",
        ],
        GpuVendor::Intel => &[
            "--disable-features=VaapiVideoDecoder",
            "--disable-accelerated-video-decode",
        ],
        GpuVendor::Amd | GpuVendor::Other => {
            &["--disable-features=VaapiVideoDecoder,VaapiVideoEncoder"]
        }
    };
    Stage::new(
        &format!("{}_vaapi", vendor.as_str()),
        &format!("Disable VA-API video paths for the {} driver", vendor.as_str()),
        flags,
    )
}
