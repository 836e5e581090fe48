// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use config::{Config, File};

use crate::RelayNodeConfig;

/// A helper function that will search for all config files in the given
/// directory and return them as a vec of the paths.
///
/// Supported file extensions are:
/// - `.toml`.
/// - `.json`.
pub fn search_config_files<P: AsRef<Path>>(
    base_dir: P,
) -> mixnet_relay_utils::Result<Vec<PathBuf>> {
    // A pattern that covers all toml or json files in the config directory
    // and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", base_dir.as_ref().display());
    let json_pattern = format!("{}/**/*.json", base_dir.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let toml_files = glob::glob(&toml_pattern)?;
    let json_files = glob::glob(&json_pattern)?;
    toml_files
        .chain(json_files)
        .map(|v| v.map_err(mixnet_relay_utils::Error::from))
        .collect()
}

/// Try to parse the [`RelayNodeConfig`] from the given config file(s).
pub fn parse_from_files(
    files: &[PathBuf],
) -> mixnet_relay_utils::Result<RelayNodeConfig> {
    let mut builder = Config::builder();
    for config_file in files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(File::from(config_file.as_path()).format(format));
    }

    // also merge in the environment (with a prefix of MIXNET).
    let builder = builder
        .add_source(config::Environment::with_prefix("MIXNET").separator("_"));
    let cfg = builder.build()?;
    let config: Result<
        RelayNodeConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Load the configuration files and
///
/// Returns `Ok(RelayNodeConfig)` on success, or `Err(Error)` on failure.
///
/// it is the same as using the [`search_config_files`] and
/// [`parse_from_files`] functions combined.
pub fn load<P: AsRef<Path>>(
    path: P,
) -> mixnet_relay_utils::Result<RelayNodeConfig> {
    parse_from_files(&search_config_files(path)?)
}

/// The postloading_process exists to validate configuration and standardize
/// the format of the configuration
pub fn postloading_process(
    config: RelayNodeConfig,
) -> mixnet_relay_utils::Result<RelayNodeConfig> {
    tracing::trace!("Checking configration sanity ...");

    if config.indexer.max_block_range == 0 {
        return Err(mixnet_relay_utils::Error::Generic(
            "indexer.max-block-range must be greater than zero",
        ));
    }
    let min_win_prob = config.tickets.min_win_prob;
    if !(min_win_prob > 0.0 && min_win_prob <= 1.0) {
        return Err(mixnet_relay_utils::Error::Generic(
            "tickets.min-win-prob must be in (0, 1]",
        ));
    }
    if config.tx_manager.keep_confirmed == 0 {
        tracing::warn!(
            "!!WARNING!!: tx-manager.keep-confirmed is 0, confirmed \
             transactions are forgotten right away"
        );
    }
    if config.chain.private_key.is_none() {
        tracing::warn!(
            "!!WARNING!!: no chain.private-key configured, \
             the node indexes read-only and never resends transactions"
        );
    }

    tracing::trace!(
        "postloaded config: {}",
        serde_json::to_string_pretty(&config)?
    );

    Ok(config)
}
