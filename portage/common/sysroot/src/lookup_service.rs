// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client of the prebuilts cloud binhost lookup service.
//!
//! Requests are `LookupBinhostsRequest` protos, URL-safe base64 encoded into
//! the `filter` query parameter; responses are base64 encoded
//! `LookupBinhostsResponse` protos. The HTTP call goes through `curl` so that
//! it runs like every other external tool.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use processes::{CommandRunner, CommandSpec};
use prost::Message;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    binhost::{BinhostLookup, BinhostLookupServiceData},
    build_target::BuildTarget,
    layout::Layout,
    sysroot::Sysroot,
};

const LOOKUP_URL_PROD: &str =
    "https://us-central1-chromeos-prebuilts.cloudfunctions.net/prod-lookup-service-binhosts";
const LOOKUP_URL_STAGING: &str =
    "https://us-central1-chromeos-prebuilts.cloudfunctions.net/staging-lookup-service-binhosts";
const GS_BUCKET_PROD: &str = "chromeos-prebuilt";
const GS_BUCKET_STAGING: &str = "staging-chromeos-prebuilt";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Snapshots considered when they are read from the checkout.
const MAX_SNAPSHOTS: usize = 5;

const EXTERNAL_REMOTE: &str = "cros";
const INTERNAL_REMOTE: &str = "cros-internal";

#[derive(Clone, PartialEq, Message)]
pub struct LookupBinhostsRequest {
    #[prost(string, repeated, tag = "1")]
    pub snapshot_shas: Vec<String>,
    #[prost(string, tag = "2")]
    pub build_target: String,
    #[prost(string, tag = "3")]
    pub profile: String,
    #[prost(bool, tag = "4")]
    pub private: bool,
    /// Also return the external binhosts matching internal snapshots.
    #[prost(bool, tag = "5")]
    pub get_corresponding_binhosts: bool,
    #[prost(string, tag = "6")]
    pub generic_build_target: String,
    #[prost(string, tag = "7")]
    pub generic_profile: String,
    #[prost(string, tag = "8")]
    pub gs_bucket_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LookupBinhostsResponse {
    /// Newest first.
    #[prost(message, repeated, tag = "1")]
    pub binhosts: Vec<Binhost>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Binhost {
    #[prost(string, tag = "1")]
    pub binhost_id: String,
    #[prost(string, tag = "2")]
    pub gs_uri: String,
    #[prost(message, optional, tag = "3")]
    pub created_at: Option<prost_types::Timestamp>,
}

/// Which snapshots to ask about, and with what visibility.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SnapshotQuery {
    snapshot_shas: Vec<String>,
    private: bool,
    get_corresponding_binhosts: bool,
    is_staging: bool,
}

/// Looks binhosts up in the prebuilts cloud service.
///
/// Without snapshot SHAs in the lookup data, the SHAs of the checkout's
/// manifest snapshots are used, but only when the checkout tracks `main`,
/// `snapshot` or `stable`.
pub struct ServiceBinhostLookup<'a> {
    runner: &'a dyn CommandRunner,
    layout: Layout,
}

impl<'a> ServiceBinhostLookup<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: Layout) -> Self {
        Self { runner, layout }
    }

    fn git_stdout(&self, dir: &str, args: &[&str]) -> Result<String> {
        let dir = self.layout.source_root.join(dir);
        let output = self.runner.run(
            &CommandSpec::new("git")
                .arg("-C")
                .arg(dir.to_string_lossy())
                .args(args.iter().copied())
                .capture_output(),
        )?;
        Ok(output.stdout)
    }

    fn manifest_branch(&self) -> Result<String> {
        let merge =
            self.git_stdout(".repo/manifests", &["config", "--get", "branch.default.merge"])?;
        let merge = merge.trim();
        Ok(merge.strip_prefix("refs/heads/").unwrap_or(merge).to_owned())
    }

    /// The latest snapshot SHAs of one manifest repository. Failures yield
    /// nothing; the service copes with an empty list.
    fn snapshot_shas(&self, internal: bool, branch: &str) -> Vec<String> {
        let (dir, remote) = if internal {
            ("manifest-internal", INTERNAL_REMOTE)
        } else {
            ("manifest", EXTERNAL_REMOTE)
        };
        let max_count = format!("--max-count={MAX_SNAPSHOTS}");
        let rev = format!("{remote}/{branch}");
        let args = ["log", "--format=format:%H", max_count.as_str(), rev.as_str()];
        match self.git_stdout(dir, &args) {
            Ok(log) => log.lines().map(str::to_owned).collect(),
            Err(e) => {
                warn!("Failed to read snapshots of {dir}: {e:#}");
                Vec::new()
            }
        }
    }

    fn query(&self, data: Option<&BinhostLookupServiceData>) -> Result<Option<SnapshotQuery>> {
        if let Some(data) = data.filter(|data| !data.snapshot_shas.is_empty()) {
            return Ok(Some(SnapshotQuery {
                snapshot_shas: data.snapshot_shas.clone(),
                private: data.private,
                get_corresponding_binhosts: false,
                is_staging: data.is_staging,
            }));
        }

        let branch = self.manifest_branch()?;
        if !matches!(branch.as_str(), "main" | "snapshot" | "stable") {
            info!("Manifest is not tracking main, skipping lookup service.");
            return Ok(None);
        }
        let snapshot_branch = if branch == "stable" { "stable" } else { "snapshot" };

        let has_internal = self.layout.source_root.join("manifest-internal").is_dir();
        let internal = if has_internal {
            self.snapshot_shas(true, snapshot_branch)
        } else {
            Vec::new()
        };
        Ok(Some(if !internal.is_empty() {
            SnapshotQuery {
                snapshot_shas: internal,
                private: true,
                get_corresponding_binhosts: true,
                is_staging: false,
            }
        } else {
            SnapshotQuery {
                snapshot_shas: self.snapshot_shas(false, snapshot_branch),
                private: false,
                get_corresponding_binhosts: has_internal,
                is_staging: false,
            }
        }))
    }

    /// Calls the service. Returns the binhosts newest first.
    fn fetch(&self, request: &LookupBinhostsRequest, is_staging: bool) -> Result<Vec<String>> {
        let endpoint = if is_staging {
            LOOKUP_URL_STAGING
        } else {
            LOOKUP_URL_PROD
        };
        let url = format!("{endpoint}?filter={}", URL_SAFE.encode(request.encode_to_vec()));
        let max_time = LOOKUP_TIMEOUT.as_secs().to_string();
        let output = self.runner.run(
            &CommandSpec::new("curl")
                .args([
                    "--silent",
                    "--show-error",
                    "--max-time",
                    max_time.as_str(),
                    "--write-out",
                    "\n%{http_code}",
                    url.as_str(),
                ])
                .capture_output(),
        )?;
        parse_lookup_response(&output.stdout)
    }
}

/// Splits `curl --write-out '\n%{http_code}'` output and decodes the body.
fn parse_lookup_response(stdout: &str) -> Result<Vec<String>> {
    let (body, status) = stdout
        .rsplit_once('\n')
        .context("No HTTP status in the lookup service response")?;
    match status.trim() {
        "200" => {
            let bytes = URL_SAFE
                .decode(body.trim())
                .context("Lookup service response is not base64")?;
            let response = LookupBinhostsResponse::decode(bytes.as_slice())
                .context("Malformed lookup service response")?;
            Ok(response
                .binhosts
                .into_iter()
                .map(|binhost| binhost.gs_uri)
                .collect())
        }
        "404" => {
            warn!("No suitable binhosts found in the binhost lookup service");
            Ok(Vec::new())
        }
        status => bail!("Binhost lookup service returned {status}: {}", body.trim()),
    }
}

impl BinhostLookup for ServiceBinhostLookup<'_> {
    /// Binhosts oldest first, the order Portage gives increasing priority.
    fn lookup_binhosts(
        &self,
        target: &BuildTarget,
        data: Option<&BinhostLookupServiceData>,
    ) -> Result<Vec<String>> {
        let Some(query) = self.query(data)? else {
            return Ok(Vec::new());
        };

        let sysroot = Sysroot::new(target.root());
        let arch = if sysroot.join("etc/make.conf.board_setup").exists() {
            sysroot.standard_field("ARCH")?
        } else {
            None
        };

        let request = LookupBinhostsRequest {
            snapshot_shas: query.snapshot_shas,
            build_target: target.name().to_owned(),
            profile: target.profile().to_owned(),
            private: query.private,
            get_corresponding_binhosts: query.get_corresponding_binhosts,
            generic_build_target: arch.map(|arch| format!("{arch}-generic")).unwrap_or_default(),
            generic_profile: "base".to_owned(),
            gs_bucket_name: if query.is_staging {
                GS_BUCKET_STAGING
            } else {
                GS_BUCKET_PROD
            }
            .to_owned(),
        };
        let mut binhosts = self.fetch(&request, query.is_staging)?;
        binhosts.reverse();
        Ok(binhosts)
    }
}
