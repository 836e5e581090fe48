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

use anyhow::Context;
use directories_next::ProjectDirs;
use structopt::StructOpt;

use crate::RelayNodeConfig;

/// Package identifier, where the default configuration & database are
/// defined. If the user does not start the node with the `--config-dir`
/// it will default to read from the default location depending on the OS.
pub const PACKAGE_ID: [&str; 3] = ["net", "mixnet", "mixnet-relay-node"];

/// The Mixnet Relay Node Command-line tool
///
/// Start the node from a config directory:
///
/// $ mixnet-relay-node -vvv -c <CONFIG_DIR_PATH>
#[derive(StructOpt, Debug)]
#[structopt(name = "Mixnet Relay Node")]
pub struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: i32,
    /// Directory that contains configration files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    pub config_dir: Option<PathBuf>,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    pub tmp: bool,
}

/// Loads the configuration from the given directory, or from the default
/// config directory of the OS.
pub fn load_config<P>(
    config_dir: Option<P>,
) -> Result<RelayNodeConfig, anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("Getting default dirs for the relay node");
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let path = match config_dir {
        Some(p) => p.as_ref().to_path_buf(),
        None => dirs.config_dir().to_path_buf(),
    };
    // return an error if the path is not a directory.
    if !path.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", path.display()));
    }
    tracing::trace!("Loading Config from {} ..", path.display());
    let v = crate::utils::load(path)?;
    tracing::trace!("Config loaded..");
    Ok(v)
}

/// Sets up the logger for the node, based on the verbosity level passed in.
///
/// `0` only logs errors, every further `-v` opens one more level up to
/// trace. `RUST_LOG` directives are honoured on top.
pub fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in [
        "mixnet_relay_node",
        "mixnet_chain_indexer",
        "mixnet_tx_manager",
        "mixnet_ticket_validation",
        "mixnet_relay_store",
        mixnet_relay_utils::probe::TARGET,
    ] {
        env_filter = env_filter.add_directive(
            format!("{target}={log_level}")
                .parse()
                .context("invalid log directive")?,
        );
    }
    let logger = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter);
    // if we are not compiling for integration tests, we should use pretty logs
    #[cfg(not(feature = "integration-tests"))]
    let logger = logger.pretty();
    // otherwise, we should use json, which is easy to parse.
    #[cfg(feature = "integration-tests")]
    let logger = logger.json().flatten_event(true).with_current_span(false);

    logger
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set up logger: {e}"))?;
    Ok(())
}

/// Creates a database store for the node based on the options passed in.
///
/// With `--tmp` the store lives in a temporary directory, otherwise next to
/// the config directory (or in the OS data directory).
pub fn create_store(
    opts: &Opts,
) -> anyhow::Result<mixnet_relay_store::SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = mixnet_relay_store::SledStore::temporary()?;
        return Ok(store);
    }
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let p = match opts.config_dir.as_ref() {
        Some(p) => p.to_path_buf(),
        None => dirs.data_local_dir().to_path_buf(),
    };
    let db_path = match opts.config_dir.as_ref().zip(p.parent()) {
        Some((_, parent)) => parent.join("store"),
        None => p.join("store"),
    };

    let store = mixnet_relay_store::SledStore::open(db_path)?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let opts =
            Opts::from_iter(["mixnet-relay-node", "-vvv", "-c", "/tmp/x", "--tmp"]);
        assert_eq!(opts.verbose, 3);
        assert_eq!(opts.config_dir, Some(PathBuf::from("/tmp/x")));
        assert!(opts.tmp);
    }

    #[test]
    fn missing_config_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(load_config(Some(missing)).is_err());
    }
}
