// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds board packages with Bazel instead of emerge.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Local};
use itertools::Itertools;
use lazy_static::lazy_static;
use processes::{CommandError, CommandSpec};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    io::Write,
    path::Path,
    time::Duration,
};
use tracing::{info, instrument, warn};

use crate::{
    build_events::load_build_events_jsonl,
    build_target::BuildTarget,
    constants::{
        SDK_BOARD, SDK_BOOTSTRAP_PROFILE, TARGET_OS_DEV_PKG, TARGET_OS_FACTORY_PKG,
        TARGET_OS_FACTORY_SHIM_PKG, TARGET_OS_PKG, TARGET_OS_TEST_PKG,
    },
    context::Context,
    failures::write_die_hook_status_file,
    package_info::PackageInfo,
    portage::print_process_tree,
};

lazy_static! {
    static ref FAILED_LABEL_RE: Regex =
        Regex::new(r"^@@_main~portage~portage//.*/([^/]+)/([^:]+):(.*)").unwrap();
    static ref CQUERY_TARGET_RE: Regex = Regex::new(r"(.*) \(").unwrap();
}

/// What a lite build covers.
const LITE_TOP_LEVEL_PACKAGES: [&str; 5] = [
    TARGET_OS_PKG,
    TARGET_OS_TEST_PKG,
    TARGET_OS_DEV_PKG,
    TARGET_OS_FACTORY_PKG,
    TARGET_OS_FACTORY_SHIM_PKG,
];

/// Packages that, along with everything depending on them, a lite build
/// skips.
const LITE_EXCLUDED_PACKAGES: [&str; 1] = ["chromeos-base/chromeos-chrome"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BazelOptions {
    /// Build a reduced set of packages without installing a sysroot.
    pub lite: bool,
    pub remote_execution: bool,
}

/// The cquery selecting every ebuild the lite top-level packages depend on,
/// minus whatever depends on the board's stage2 Chrome target.
pub fn lite_query() -> String {
    let top_level = LITE_TOP_LEVEL_PACKAGES
        .iter()
        .map(|package| {
            format!(
                "\n    kind(\"ebuild\",\n        deps(@portage//target/{package})\n    )\n    "
            )
        })
        .join("union");
    let exclusion = LITE_EXCLUDED_PACKAGES
        .iter()
        .map(|package| {
            format!(
                "\n        filter(\n            \
                 \"//internal/packages/stage2/target/board/chromiumos/{package}:\",\n            \
                 kind(\"ebuild\", deps(@portage//target/{package}))\n        )\n        "
            )
        })
        .join("union");
    format!(
        "\nlet targets = {top_level}\nin\n    $targets except rdeps(\n        $targets,{exclusion}\n    )\n        "
    )
}

/// Targets from cquery output lines like
/// `@portage//internal/.../chromeos-base/crosid:0.0.1-r209 (7729267)`.
fn parse_cquery_targets(stdout: &str) -> Vec<String> {
    CQUERY_TARGET_RE
        .captures_iter(stdout)
        .map(|caps| caps[1].to_owned())
        .collect()
}

fn bazel(ctx: &Context) -> CommandSpec {
    CommandSpec::new(ctx.layout.chromite_bin("bazel"))
}

/// Packages whose ebuild actions failed, per the build event file. Their
/// logs are appended to where Portage would have put them under
/// `board_root`.
pub fn failed_packages_from_build_events(
    events_file: &Path,
    workspace: &Path,
    board_root: &Path,
    now: DateTime<Local>,
) -> Result<Vec<PackageInfo>> {
    let mut failed = BTreeSet::new();
    for event in load_build_events_jsonl(events_file)? {
        let Some(action) = event.failed_action() else {
            continue;
        };
        let Some(caps) = FAILED_LABEL_RE.captures(&action.label) else {
            continue;
        };
        let (category, pn, pvr) = (&caps[1], &caps[2], &caps[3]);
        let pf = format!("{pn}-{pvr}");
        let package = match PackageInfo::parse(&format!("{category}/{pf}")) {
            Ok(package) => package,
            Err(e) => {
                warn!("Ignoring failed action {}: {e:#}", action.label);
                continue;
            }
        };

        if let Some(primary_output) = &action.primary_output {
            let log = workspace
                .join(primary_output)
                .with_file_name(format!("{pf}.log"));
            if log.exists() {
                let dest = board_root.join(format!(
                    "tmp/portage/logs/{category}:{pf}:{}.log",
                    now.format("%Y%m%d-%H%M%S")
                ));
                copy_log(&log, &dest)?;
            }
        }
        failed.insert(package);
    }
    Ok(failed.into_iter().collect())
}

fn copy_log(src: &Path, dest: &Path) -> Result<()> {
    let content =
        std::fs::read(src).with_context(|| format!("Failed to read {}", src.display()))?;
    // Appending handles a package failing in more than one stage.
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dest)
        .with_context(|| format!("Failed to open {}", dest.display()))?;
    writeln!(out, "(Copied from {} to {})", src.display(), dest.display())?;
    out.write_all(&content)?;
    Ok(())
}

/// Builds `packages` for `target` with Bazel.
///
/// On failure the failed packages are recorded in the die hook status file so
/// the emerge failure handling applies unchanged. The artifact post-processing
/// runs whatever the build result; its own failure only surfaces when the
/// build succeeded.
#[instrument(skip_all, fields(board = target.name(), lite = options.lite))]
pub fn bazel_build(
    ctx: &Context,
    target: &BuildTarget,
    packages: &[String],
    options: BazelOptions,
    extra_env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> Result<(), CommandError> {
    let layout = &ctx.layout;
    ctx.runner.run(
        &CommandSpec::new(layout.chromite_shell("create_sdk_board_root"))
            .args(["--board", SDK_BOARD, "--profile", SDK_BOOTSTRAP_PROFILE]),
    )?;

    let mut env = extra_env.clone();
    env.insert("BOARD".to_owned(), target.name().to_owned());

    let targets = if options.lite {
        let output = ctx.runner.run(
            &bazel(ctx)
                .arg("cquery")
                .arg(format!("--profile={}", layout.bazel_cquery_profile().display()))
                .arg(lite_query())
                .envs(env.clone())
                .capture_output(),
        )?;
        parse_cquery_targets(&output.stdout)
    } else {
        packages
            .iter()
            .map(|package| format!("@portage//target/{package}:installed"))
            .collect()
    };

    let mut build = bazel(ctx)
        .arg("build")
        .arg(format!("--profile={}", layout.bazel_command_profile().display()))
        .args([
            "--noslim_profile",
            "--experimental_profile_include_target_label",
            "--experimental_profile_include_primary_output",
        ])
        // Lite builds gather as many failures as possible; full builds stop
        // at the first one.
        .arg(format!("--keep_going={}", options.lite))
        .arg(format!(
            "--experimental_execution_log_compact_file={}",
            layout.bazel_exec_log().display()
        ))
        .args([
            "--config=hash_tracer",
            "--config=collect_logs",
            "--config=collect_ebuild_metadata",
        ])
        .arg(format!(
            "--build_event_json_file={}",
            layout.bazel_build_events().display()
        ))
        .args([
            "--experimental_enable_execution_graph_log",
            "--experimental_execution_graph_log_dep_type=all",
        ])
        .arg(format!(
            "--experimental_execution_graph_log_path={}",
            layout.bazel_graph_log().display()
        ));
    if options.remote_execution {
        build = build.arg("--config=rbe_exec");
    }
    let build = build
        .args(targets)
        .envs(env.clone())
        .timeout(timeout)
        .pre_timeout_hook(print_process_tree);

    let result = ctx.runner.run(&build).map(|_| ());
    if result.is_err() {
        record_failed_packages(ctx, target);
    }

    let post_process = ctx.runner.run(
        &bazel(ctx)
            .args(["run", "//bazel/portage/tools/process_artifacts", "--"])
            .arg(format!(
                "--build-events-jsonl={}",
                layout.bazel_build_events().display()
            ))
            .arg(format!("--archive-logs={}", layout.bazel_action_logs().display()))
            .arg(format!("--prebuilts={}", layout.bazel_prebuilts().display()))
            .envs(env),
    );
    match (result, post_process) {
        (Err(e), post) => {
            if let Err(post) = post {
                warn!("Processing Bazel artifacts failed after a failed build: {post}");
            }
            Err(e)
        }
        (Ok(()), Err(post)) => Err(post),
        (Ok(()), Ok(_)) => Ok(()),
    }
}

fn record_failed_packages(ctx: &Context, target: &BuildTarget) {
    let layout = &ctx.layout;
    let failed = match failed_packages_from_build_events(
        &layout.bazel_build_events(),
        &layout.bazel_workspace(),
        target.root(),
        Local::now(),
    ) {
        Ok(failed) => failed,
        Err(e) => {
            warn!("Could not read failed packages from the build events: {e:#}");
            return;
        }
    };
    if failed.is_empty() {
        return;
    }
    info!(
        "Failed packages: {}",
        failed.iter().map(PackageInfo::cpvr).join(" ")
    );
    if let Err(e) = write_die_hook_status_file(&layout.die_hook_status_file(), &failed) {
        warn!("{e:#}");
    }
}
