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

use std::sync::OnceLock;

use derive_more::Display;
use regex::Regex;

/// What kind of failure a chain provider reported.
///
/// Used as the label of the provider error metric.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// The request or the connection timed out.
    #[display(fmt = "timeout")]
    Timeout,
    /// The connection was reset or closed by the remote.
    #[display(fmt = "connection_reset")]
    ConnectionReset,
    /// Nothing listens at the endpoint.
    #[display(fmt = "connection_refused")]
    ConnectionRefused,
    /// The provider throttles us.
    #[display(fmt = "rate_limited")]
    RateLimited,
    /// The provider answered with a server side failure.
    #[display(fmt = "server_error")]
    ServerError,
    /// The message did not match any known failure.
    #[display(fmt = "unknown")]
    Unknown,
}

struct Patterns {
    timeout: Regex,
    reset: Regex,
    refused: Regex,
    rate_limited: Regex,
    server_error: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        timeout: Regex::new(r"(?i)(timed? ?out|etimedout|deadline)")
            .expect("valid regex"),
        reset: Regex::new(
            r"(?i)(econnreset|connection reset|broken pipe|connection closed)",
        )
        .expect("valid regex"),
        refused: Regex::new(r"(?i)(econnrefused|connection refused)")
            .expect("valid regex"),
        rate_limited: Regex::new(
            r"(?i)\b(rate|limit|429|too many requests|daily request count exceeded)\b",
        )
        .expect("valid regex"),
        server_error: Regex::new(
            r"(?i)(\b5\d\d\b|internal server error|bad gateway|service unavailable|header not found)",
        )
        .expect("valid regex"),
    })
}

impl ProviderErrorKind {
    /// Classifies a provider error message.
    ///
    /// The first matching class wins, in declaration order.
    pub fn classify(message: &str) -> Self {
        let p = patterns();
        let kind = if p.timeout.is_match(message) {
            Self::Timeout
        } else if p.reset.is_match(message) {
            Self::ConnectionReset
        } else if p.refused.is_match(message) {
            Self::ConnectionRefused
        } else if p.rate_limited.is_match(message) {
            Self::RateLimited
        } else if p.server_error.is_match(message) {
            Self::ServerError
        } else {
            Self::Unknown
        };
        tracing::event!(
            target: mixnet_relay_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %mixnet_relay_utils::probe::Kind::Retry,
            provider_error = %kind,
            error = %message,
        );
        kind
    }
}
