// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for emutest.
//!
//! The configuration is layered: the embedded [default config](EmutestConfig::DEFAULT_CONFIG) is
//! loaded first, and the workspace's `.config/emutest.toml` (or an explicitly passed file) is
//! merged on top of it.

use crate::{
    build_tool::OptLevel,
    errors::{ConfigParseError, ConfigParseErrorKind},
    list::{TestList, TestName},
    worker::EmulatorCommand,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, num::NonZeroUsize, time::Duration};
use tracing::warn;

/// Trait for handling configuration warnings.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// Reports configuration warnings through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push_str("\n  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!(
            "in config file {}, ignoring unknown configuration {unknown_str}",
            config_file
                .strip_prefix(workspace_root)
                .unwrap_or(config_file),
        );
    }
}

/// Overall configuration for emutest.
#[derive(Clone, Debug)]
pub struct EmutestConfig {
    workspace_root: Utf8PathBuf,
    tests: TestList,
    build: BuildConfig,
    emulator: EmulatorConfig,
    run: RunConfig,
}

impl EmutestConfig {
    /// The default location of the config within the workspace root.
    pub const CONFIG_PATH: &'static str = ".config/emutest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the emutest config from the given file, or if not specified from
    /// `.config/emutest.toml` in the workspace root.
    ///
    /// An explicitly passed file must exist; the default location is optional.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &workspace_root, &unknown);
        }

        let tests = TestList::new(config.tests)
            .map_err(|err| ConfigParseError::new(&config_file, err.into()))?;

        Ok(Self {
            workspace_root,
            tests,
            build: config.build,
            emulator: config.emulator,
            run: config.run,
        })
    }

    /// Returns the default config, as if no config file were present.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let (config, _unknown) = Self::build_and_deserialize_config(&Self::make_default_config())
            .expect("default config is always valid");
        Self {
            workspace_root: workspace_root.into(),
            tests: TestList::default(),
            build: config.build,
            emulator: config.emulator,
            run: config.run,
        }
    }

    /// Returns the workspace root. The build tool and the emulator are run from here.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the configured tests, in order.
    pub fn tests(&self) -> &TestList {
        &self.tests
    }

    /// Returns the build configuration.
    pub fn build(&self) -> &BuildConfig {
        &self.build
    }

    /// Returns the emulator configuration.
    pub fn emulator(&self) -> &EmulatorConfig {
        &self.emulator
    }

    /// Returns the run configuration.
    pub fn run(&self) -> &RunConfig {
        &self.run
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(EmutestConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: EmutestConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // serde_path_to_error already records the key, so drop the config crate's copy.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct EmutestConfigDeserialize {
    tests: Vec<TestName>,
    build: BuildConfig,
    emulator: EmulatorConfig,
    run: RunConfig,
}

/// Configuration for the external build tool.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildConfig {
    /// The build tool.
    pub program: String,

    /// Arguments for the pre-run clean step.
    pub clean_args: Vec<String>,

    /// The board to build for, passed as `TARGET_BOARD`.
    #[serde(default)]
    pub board: Option<String>,

    /// The number of parallel jobs, passed as `-j<jobs>`.
    #[serde(default)]
    pub jobs: Option<NonZeroUsize>,

    /// Extra arguments appended to every build.
    pub extra_args: Vec<String>,

    /// Compiler flags for each optimization level.
    pub optimize_flags: OptimizeFlags,
}

/// Compiler flags passed to the build tool as `OPTIMIZE_FLAGS`.
#[derive(Clone, Debug, Deserialize)]
pub struct OptimizeFlags {
    /// Flags for [`OptLevel::Debug`].
    pub debug: String,

    /// Flags for [`OptLevel::Release`].
    pub release: String,
}

impl OptimizeFlags {
    /// Returns the flags for the given optimization level.
    pub fn for_level(&self, level: OptLevel) -> &str {
        match level {
            OptLevel::Debug => &self.debug,
            OptLevel::Release => &self.release,
        }
    }
}

/// Configuration for the emulator.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmulatorConfig {
    /// The emulator program.
    pub program: String,

    /// The machine to emulate, passed as `-M <machine>`.
    pub machine: String,

    /// Arguments inserted between the machine and the kernel image.
    pub extra_args: Vec<String>,

    /// The directory built images are placed in, relative to the workspace root.
    pub artifact_dir: Utf8PathBuf,

    /// The file extension of built images.
    pub artifact_extension: String,
}

impl EmulatorConfig {
    /// Returns the path to the image built for `test`, relative to the workspace root.
    pub fn artifact_path(&self, test: &TestName) -> Utf8PathBuf {
        self.artifact_dir
            .join(format!("{test}.{}", self.artifact_extension))
    }

    /// Returns the emulator command line that runs `test`.
    pub fn command(&self, test: &TestName) -> EmulatorCommand {
        let mut args = vec!["-M".to_owned(), self.machine.clone()];
        args.extend(self.extra_args.iter().cloned());
        args.push("-kernel".to_owned());
        args.push(self.artifact_path(test).into_string());
        EmulatorCommand {
            program: self.program.clone(),
            args,
        }
    }
}

/// Configuration for test execution.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    /// How long a test may run before it is killed.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// How long to wait for the emulator pid after a timed-out worker has been reaped.
    #[serde(with = "humantime_serde")]
    pub pid_read_timeout: Duration,
}
