//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `launch`        | `Launch`                                           |
//! | `stages`        | `Stages`, `Probe`                                  |
//! | `logs`          | `Logs`                                             |
//! | `diag`          | `Diag`                                             |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod diag;
pub mod launch;
pub mod logs;
pub mod stages;

pub use config::cmd_config;
pub use diag::cmd_diag;
pub use launch::cmd_launch;
pub use logs::cmd_logs;
pub use stages::{cmd_probe, cmd_stages};
