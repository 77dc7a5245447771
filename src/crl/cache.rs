// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk CRL cache with age-based staleness.
//!
//! Freshness is governed only by the cache file's modification time compared
//! with a configured maximum age; the CRL's own `nextUpdate` is reported for
//! diagnostics but never drives a refresh.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usg_cert_agent::crl::{HttpCrlSource, RevocationCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RevocationCache::new(Arc::new(HttpCrlSource::new()?));
//! let outcome = cache
//!     .refresh_if_stale(
//!         "http://ca.example.com/ca.crl",
//!         Path::new("/var/lib/cert-agent/ca.crl"),
//!         24.0,
//!         Duration::from_secs(10),
//!     )
//!     .await;
//! println!("downloaded={} age={}h", outcome.downloaded, outcome.age_hours);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::fetch::CrlSource;
use super::parser::{RevocationList, parse_crl};
use crate::publish::write_atomic;

/// Age reported for a cache file that does not exist.
pub const MISSING_AGE: f64 = -1.0;

/// Mode of the cache file. CRLs are public data.
const CACHE_FILE_MODE: u32 = 0o644;

/// Result of a [`RevocationCache::refresh_if_stale`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    /// Bytes were received from the source. This does not mean the refresh
    /// succeeded: a body that is not a CRL, or that could not be written,
    /// still counts as downloaded. Check `updated` for that.
    pub downloaded: bool,
    /// The cache file was replaced.
    pub updated: bool,
    /// Cache age in hours after the call, or −1 if there is no cache file.
    pub age_hours: f64,
    /// Revoked entries in the cache after the call, when it parses.
    pub revoked_count: Option<usize>,
    /// Why a refresh attempt failed.
    pub error: Option<String>,
}

/// Freshness of the cache file against a configured maximum age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheFreshness {
    /// Configured maximum age in hours.
    pub max_age_hours: f64,
    /// Computed age in hours, or −1 if missing.
    pub age_hours: f64,
    /// Whether a refresh is due.
    pub stale: bool,
}

impl CacheFreshness {
    /// Compute freshness from an age and a maximum age.
    pub fn compute(age_hours: f64, max_age_hours: f64) -> Self {
        Self {
            max_age_hours,
            age_hours,
            stale: age_hours < 0.0 || age_hours >= max_age_hours,
        }
    }

    /// Whether the cache file exists.
    pub fn is_present(&self) -> bool {
        self.age_hours >= 0.0
    }
}

/// A cached CRL blob as read from disk.
#[derive(Debug, Clone)]
pub struct CachedCrl {
    /// Raw cached bytes.
    pub data: Vec<u8>,
    /// Cache file path.
    pub path: PathBuf,
    /// Last modification time of the file.
    pub modified: SystemTime,
}

impl CachedCrl {
    /// Parse the cached blob; `None` when it is not a usable CRL.
    pub fn parse(&self) -> Option<RevocationList> {
        parse_crl(&self.data)
    }
}

/// Locally cached CRL with fetch-or-fallback semantics.
#[derive(Clone)]
pub struct RevocationCache {
    source: Arc<dyn CrlSource>,
}

impl std::fmt::Debug for RevocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationCache").finish_non_exhaustive()
    }
}

impl RevocationCache {
    /// Create a cache that downloads through `source`.
    pub fn new(source: Arc<dyn CrlSource>) -> Self {
        Self { source }
    }

    /// Age of the cache file in hours, or [`MISSING_AGE`] if it is absent.
    ///
    /// Never fails. A modification time in the future counts as age zero.
    pub fn get_age(cache_path: &Path) -> f64 {
        let modified = match std::fs::metadata(cache_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return MISSING_AGE,
        };

        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
            / 3600.0
    }

    /// Freshness of the cache file against `max_age_hours`.
    pub fn freshness(cache_path: &Path, max_age_hours: f64) -> CacheFreshness {
        CacheFreshness::compute(Self::get_age(cache_path), max_age_hours)
    }

    /// Read the cache file, if present.
    pub fn load(cache_path: &Path) -> Option<CachedCrl> {
        let data = std::fs::read(cache_path).ok()?;
        let modified = std::fs::metadata(cache_path)
            .and_then(|m| m.modified())
            .ok()?;

        Some(CachedCrl {
            data,
            path: cache_path.to_path_buf(),
            modified,
        })
    }

    /// Refresh the cache from `url` if it is missing or older than
    /// `max_age_hours`.
    ///
    /// At most one download is attempted. On failure the existing cache file
    /// is left untouched and the outcome carries the error; this method
    /// itself never fails.
    pub async fn refresh_if_stale(
        &self,
        url: &str,
        cache_path: &Path,
        max_age_hours: f64,
        timeout: Duration,
    ) -> RefreshOutcome {
        if let Some(parent) = cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(
                        "Cannot create CRL cache directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
        }

        let freshness = Self::freshness(cache_path, max_age_hours);

        if !freshness.stale {
            debug!(
                age_hours = freshness.age_hours,
                max_age_hours, "CRL cache is fresh"
            );
            return RefreshOutcome {
                downloaded: false,
                updated: false,
                age_hours: freshness.age_hours,
                revoked_count: cached_revoked_count(cache_path),
                error: None,
            };
        }

        info!(
            url,
            age_hours = freshness.age_hours,
            max_age_hours,
            "CRL cache is stale, fetching"
        );

        let fallback = |downloaded: bool, error: String| {
            warn!(url, "CRL refresh failed, keeping previous cache: {}", error);
            RefreshOutcome {
                downloaded,
                updated: false,
                age_hours: Self::get_age(cache_path),
                revoked_count: cached_revoked_count(cache_path),
                error: Some(error),
            }
        };

        let data = match self.source.fetch(url, timeout).await {
            Ok(data) => data,
            Err(e) => return fallback(false, e.to_string()),
        };

        let Some(parsed) = parse_crl(&data) else {
            return fallback(true, format!("response from {url} is not a CRL"));
        };

        if let Err(e) = write_atomic(cache_path, &data, CACHE_FILE_MODE) {
            return fallback(true, e.to_string());
        }

        info!(
            issuer = %parsed.issuer,
            revoked = parsed.revoked_count,
            next_update = ?parsed.next_update,
            "CRL cache updated"
        );

        RefreshOutcome {
            downloaded: true,
            updated: true,
            age_hours: 0.0,
            revoked_count: Some(parsed.revoked_count),
            error: None,
        }
    }
}

fn cached_revoked_count(cache_path: &Path) -> Option<usize> {
    RevocationCache::load(cache_path)?
        .parse()
        .map(|crl| crl.revoked_count)
}
