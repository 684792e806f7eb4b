// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Chooses the binhosts Portage fetches prebuilts from.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use processes::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{build_target::BuildTarget, constants::CHROME_BINHOST_MARKER};

/// Parameters for the binhost lookup service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinhostLookupServiceData {
    /// Manifest snapshots to look prebuilts up for, newest first.
    #[serde(default)]
    pub snapshot_shas: Vec<String>,
    /// Whether private binhosts may be returned.
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub is_staging: bool,
}

/// A client of the binhost lookup service.
pub trait BinhostLookup {
    fn lookup_binhosts(
        &self,
        target: &BuildTarget,
        data: Option<&BinhostLookupServiceData>,
    ) -> Result<Vec<String>>;
}

impl<F> BinhostLookup for F
where
    F: Fn(&BuildTarget, Option<&BinhostLookupServiceData>) -> Result<Vec<String>>,
{
    fn lookup_binhosts(
        &self,
        target: &BuildTarget,
        data: Option<&BinhostLookupServiceData>,
    ) -> Result<Vec<String>> {
        self(target, data)
    }
}

/// A lookup that always finds nothing, for runs without a lookup service.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBinhostLookup;

impl BinhostLookup for NoBinhostLookup {
    fn lookup_binhosts(
        &self,
        _target: &BuildTarget,
        _data: Option<&BinhostLookupServiceData>,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Demotes a failed optional step to `None` after logging it.
pub fn best_effort<T>(what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            info!("{what} failed; continuing without it: {e:#}");
            None
        }
    }
}

/// The configured binhosts, split by what they serve. Order is preserved
/// within each group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionedBinhosts {
    pub chrome: Vec<String>,
    pub target: Vec<String>,
}

pub fn partition_binhosts(configured: &str) -> PartitionedBinhosts {
    let (chrome, target) = configured
        .split_whitespace()
        .map(str::to_owned)
        .partition(|url| url.contains(CHROME_BINHOST_MARKER));
    PartitionedBinhosts { chrome, target }
}

/// Fetched binhosts replace the configured target binhosts; Chrome binhosts
/// always come last.
pub fn select_binhosts(fetched: Option<Vec<String>>, configured: PartitionedBinhosts) -> Vec<String> {
    let mut binhosts = match fetched {
        Some(fetched) if !fetched.is_empty() => fetched,
        _ => configured.target,
    };
    binhosts.extend(configured.chrome);
    binhosts
}

/// Resolves the binhost list for a build. Lookup failures never escape.
pub fn resolve_binhosts(
    lookup: &dyn BinhostLookup,
    target: &BuildTarget,
    data: Option<&BinhostLookupServiceData>,
    configured: &str,
) -> Vec<String> {
    let fetched = best_effort(
        "Binhost lookup",
        lookup.lookup_binhosts(target, data),
    );
    if let Some(fetched) = fetched.as_ref().filter(|f| !f.is_empty()) {
        info!("Using binhosts from the lookup service: {}", fetched.join(" "));
    }
    select_binhosts(fetched, partition_binhosts(configured))
}

/// Reports when a binhost's package index was created.
pub trait BinhostAgeSource {
    fn index_created(&self, binhost: &str) -> Result<DateTime<Utc>>;
}

/// Reads the creation time of `<binhost>/Packages` with `gsutil stat`.
pub struct GsutilAgeSource<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> GsutilAgeSource<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl BinhostAgeSource for GsutilAgeSource<'_> {
    fn index_created(&self, binhost: &str) -> Result<DateTime<Utc>> {
        let index = format!("{}/Packages", binhost.trim_end_matches('/'));
        let output = self.runner.run(
            &CommandSpec::new("gsutil")
                .args(["stat", index.as_str()])
                .capture_output(),
        )?;
        parse_creation_time(&output.stdout).with_context(|| format!("gsutil stat {index}"))
    }
}

fn parse_creation_time(stat: &str) -> Result<DateTime<Utc>> {
    let value = stat
        .lines()
        .find_map(|line| line.trim().strip_prefix("Creation time:"))
        .context("no creation time")?;
    Ok(DateTime::parse_from_rfc2822(value.trim())?.with_timezone(&Utc))
}

/// Warns about binhosts at least `threshold_days` old. Lookup errors are
/// logged and skipped.
pub fn log_binhost_age(
    source: &dyn BinhostAgeSource,
    binhosts: &[String],
    threshold_days: i64,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut stale = Vec::new();
    for binhost in binhosts {
        let Some(created) = best_effort("Binhost age check", source.index_created(binhost)) else {
            continue;
        };
        let age = (now - created).num_days();
        if age >= threshold_days {
            warn!(
                "Binhost {binhost} is {age} days old. Consider running repo sync to pick up \
                 newer prebuilts."
            );
            stale.push(binhost.clone());
        }
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use testutil::{program, FakeRunner};

    fn eve() -> BuildTarget {
        BuildTarget::new("eve")
    }

    #[test]
    fn partitions_preserving_order() {
        assert_eq!(
            partition_binhosts("gs://t1/ gs://cq-1/ gs://t2/\ngs://cq-2/"),
            PartitionedBinhosts {
                chrome: vec!["gs://cq-1/".to_owned(), "gs://cq-2/".to_owned()],
                target: vec!["gs://t1/".to_owned(), "gs://t2/".to_owned()],
            }
        );
    }

    #[test]
    fn fetched_binhosts_come_before_chrome() {
        let lookup = |_: &BuildTarget, _: Option<&BinhostLookupServiceData>| -> Result<Vec<String>> {
            Ok(vec!["gs://a/".to_owned(), "gs://b/".to_owned()])
        };
        let binhosts = resolve_binhosts(&lookup, &eve(), None, "gs://old/ gs://cq-1/");
        assert_eq!(binhosts.join(" "), "gs://a/ gs://b/ gs://cq-1/");
    }

    #[test]
    fn failed_lookup_falls_back() {
        let lookup = |_: &BuildTarget, _: Option<&BinhostLookupServiceData>| -> Result<Vec<String>> {
            bail!("connection reset")
        };
        let binhosts = resolve_binhosts(&lookup, &eve(), None, "gs://cq-1/ gs://t1/ gs://t2/");
        assert_eq!(binhosts, vec!["gs://t1/", "gs://t2/", "gs://cq-1/"]);
    }

    #[test]
    fn empty_lookup_falls_back() {
        let binhosts = resolve_binhosts(&NoBinhostLookup, &eve(), None, "gs://t1/ gs://cq-1/");
        assert_eq!(binhosts, vec!["gs://t1/", "gs://cq-1/"]);
    }

    #[test]
    fn parses_gsutil_stat() -> Result<()> {
        let stat = "gs://chromeos-prebuilt/board/eve/Packages:\n    \
                    Creation time:          Tue, 14 Mar 2023 17:21:09 GMT\n    \
                    Content-Length:         1234\n";
        let created = parse_creation_time(stat)?;
        assert_eq!(created.to_rfc3339(), "2023-03-14T17:21:09+00:00");
        Ok(())
    }

    #[test]
    fn reports_stale_binhosts_and_skips_errors() -> Result<()> {
        let runner = FakeRunner::new();
        runner
            .on(
                |spec: &processes::CommandSpec| spec.has_arg("gs://bad/Packages"),
                |spec| Err(testutil::failure(spec, 1)),
            )
            .stdout(
                program("gsutil"),
                "Creation time:          Tue, 14 Mar 2023 17:21:09 GMT\n",
            );
        let source = GsutilAgeSource::new(&runner);
        let now = DateTime::parse_from_rfc3339("2023-05-01T00:00:00Z")?.with_timezone(&Utc);

        let stale = log_binhost_age(
            &source,
            &["gs://bad/".to_owned(), "gs://old/".to_owned()],
            30,
            now,
        );

        assert_eq!(stale, vec!["gs://old/"]);
        assert_eq!(runner.calls_to("gsutil").len(), 2);
        Ok(())
    }
}
