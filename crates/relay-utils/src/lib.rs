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

//! # Relay Utils Module 🕸️
//!
//! Shared building blocks for the relay node crates: the common error type,
//! retry policies, prometheus metrics and probe logging.

#![warn(missing_docs)]

/// Metrics functionality
pub mod metric;
/// A module used for debugging the node lifecycle, sync state, or other node state.
pub mod probe;
/// Retry functionality
pub mod retry;

/// An enum of all possible errors that could be encountered during the
/// execution of the relay node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error from Glob Iterator.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Hex decoding error.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWalletError(#[from] ethers::signers::WalletError),
    /// Signature recovery or parsing error.
    #[error(transparent)]
    Signature(#[from] ethers::types::SignatureError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Sled transaction error.
    #[error(transparent)]
    SledTransaction(
        #[from] sled::transaction::TransactionError<std::io::Error>,
    ),
    /// Prometheus registration or encoding error.
    #[error(transparent)]
    PrometheusError(#[from] prometheus::Error),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
    /// Historical sync gave up after too many failed chunk queries.
    #[error(
        "Backfill aborted at blocks {}..={} after {} failures",
        from_block,
        to_block,
        failures
    )]
    BackfillAborted {
        /// First block of the chunk that failed last.
        from_block: u64,
        /// Last block of the chunk that failed last.
        to_block: u64,
        /// How many chunk queries failed in total.
        failures: u32,
    },
    /// An on-chain log could not be decoded into a known event.
    #[error("Invalid event payload: {}", _0)]
    InvalidEventPayload(String),
    /// The chain provider reported a failure.
    #[error("Provider failure: {}", _0)]
    ProviderFailure(String),
    /// Waiting for a transaction confirmation timed out.
    #[error("Timed out waiting for confirmation of {:?}", _0)]
    ConfirmationTimeout(ethers::types::H256),
}

/// A type alias for the result for the relay node, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Sled(e),
        }
    }
}
