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

//! Certificate Revocation List handling.
//!
//! - [`fetch`]: downloading CRL blobs over HTTP(S)
//! - [`cache`]: the on-disk CRL cache with age-based staleness
//! - [`parser`]: extracting issuer, update times and revoked serials
//!
//! The cache is refreshed at most once per check; a failed download never
//! touches the previously cached blob.

pub mod cache;
pub mod fetch;
pub mod parser;

pub use cache::{CacheFreshness, RefreshOutcome, RevocationCache};
pub use fetch::{CrlSource, HttpCrlSource};
pub use parser::{RevocationList, normalize_serial, parse_crl};
