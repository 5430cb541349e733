use std::{fs, io, path::PathBuf, process::Stdio};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Defines how sub-process stderr and stdout are handled.
pub struct Output {
    #[serde(default)]
    /// Determines how stderr is routed.
    pub stderr: Behavior,
    #[serde(default)]
    /// Determines how stdout is routed.
    pub stdout: Behavior,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            stderr: Behavior::Quiet,
            stdout: Behavior::Quiet,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
/// Defines the [`Output`] behavior for stderr and stdout.
pub enum Behavior {
    /// Redirect stdout, stderr to /dev/null
    Quiet,
    /// Write to a location on-disk.
    Log(PathBuf),
}

impl Default for Behavior {
    fn default() -> Self {
        Self::Quiet
    }
}

pub(crate) fn stdio(behavior: &Behavior) -> Result<Stdio, io::Error> {
    match behavior {
        Behavior::Quiet => Ok(Stdio::null()),
        Behavior::Log(path) => {
            let fp = fs::File::create(path)?;
            Ok(Stdio::from(fp))
        }
    }
}
