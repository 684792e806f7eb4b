// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod return_code;

use anyhow::{ensure, Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cliutil::cli_main;
use processes::SystemRunner;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use sysroot::{
    constants::BACKTRACK_DEFAULT,
    package_info::PackageInfo,
    prebuilts::{sync_board_prebuilts, BoardPrebuilts, RetryPolicy},
    ArtifactKind, BinhostLookup, BinhostLookupServiceData, BuildPackagesRunConfig, BuildTarget,
    Context, Error, GsutilAgeSource, Layout, ProcessEnv, RealHost, ServiceBinhostLookup,
    SetupBoardRunConfig, Sysroot,
};
use tracing::{error, info};

use crate::return_code::ReturnCode;

const ACCEPTED_LICENSES: &str = "@CHROMEOS";

/// How long before the caller's deadline the package build is cut off.
const TIMEOUT_MARGIN_MINUTES: i64 = 10;

#[derive(Parser, Debug)]
#[command(name = "cros_sysroot")]
#[command(author = "ChromiumOS Authors")]
#[command(about = "Sets up board sysroots and builds packages into them", long_about = None)]
struct Cli {
    /// Path to the ChromiumOS checkout as seen inside the chroot.
    #[arg(long, value_name = "DIR", global = true)]
    source_root: Option<PathBuf>,

    /// Checks the arguments and exits without doing anything.
    #[arg(long, global = true)]
    validate_only: bool,

    /// Answers with a canned result instead of doing anything.
    #[arg(long, value_enum, value_name = "RESULT", global = true)]
    mock_call: Option<MockCall>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MockCall {
    Success,
    Failure,
    Error,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Name of board.
    #[arg(short = 'b', long, value_name = "NAME")]
    board: String,

    /// Profile of the board, relative to the board overlay's profiles.
    #[arg(short = 'p', long, value_name = "PROFILE")]
    profile: Option<String>,

    /// Root of the board's sysroot. Defaults to /build/<board>.
    #[arg(long, value_name = "DIR")]
    sysroot: Option<PathBuf>,
}

impl TargetArgs {
    fn build_target(&self) -> Result<BuildTarget> {
        ensure!(!self.board.is_empty(), "--board must not be empty");
        let mut target = BuildTarget::new(&self.board);
        if let Some(profile) = &self.profile {
            target = target.with_profile(profile);
        }
        if let Some(root) = &self.sysroot {
            target = target.with_root(root.clone());
        }
        Ok(target)
    }
}

#[derive(Args, Debug)]
struct BinhostArgs {
    /// JSON file with parameters for the binhost lookup service.
    #[arg(long, value_name = "FILE")]
    binhost_lookup_service_data: Option<PathBuf>,
}

impl BinhostArgs {
    fn load(&self) -> Result<Option<BinhostLookupServiceData>> {
        let Some(path) = &self.binhost_lookup_service_data else {
            return Ok(None);
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let data = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(data))
    }
}

#[derive(Args, Debug)]
struct SetupBoardArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Makes this board the default one.
    #[arg(long)]
    default: bool,

    /// Deletes and recreates an existing sysroot.
    #[arg(long)]
    force: bool,

    /// The board's toolchain changed; implies --force.
    #[arg(long)]
    toolchain_changed: bool,

    /// Builds from source instead of using binary packages.
    #[arg(long)]
    nousepkg: bool,

    #[arg(long)]
    jobs: Option<u32>,

    /// Only regenerates the configs of an existing sysroot.
    #[arg(long)]
    regen_configs: bool,

    #[arg(long)]
    quiet: bool,

    #[arg(long)]
    update_toolchain: bool,

    /// Assumes the chroot is already up to date.
    #[arg(long)]
    skip_chroot_upgrade: bool,

    /// Leaves the board's toolchain and implicit system packages out.
    #[arg(long)]
    skip_toolchain_install: bool,

    /// Uses only locally built binary packages.
    #[arg(long)]
    local_build: bool,

    #[arg(long)]
    expanded_binhost_inheritance: bool,

    /// Includes Chrome prebuilts from CQ binhosts.
    #[arg(long)]
    use_cq_prebuilts: bool,

    #[arg(long, default_value_t = BACKTRACK_DEFAULT)]
    backtrack: u32,

    #[command(flatten)]
    binhost: BinhostArgs,
}

impl SetupBoardArgs {
    fn run_config(&self) -> Result<SetupBoardRunConfig> {
        Ok(SetupBoardRunConfig::builder()
            .set_default(self.default)
            .force(self.force)
            .toolchain_changed(self.toolchain_changed)
            .usepkg(!self.nousepkg)
            .jobs(self.jobs)
            .regen_configs(self.regen_configs)
            .quiet(self.quiet)
            .update_toolchain(self.update_toolchain)
            .update_chroot(!self.skip_chroot_upgrade)
            .init_board_pkgs(!self.skip_toolchain_install)
            .local_build(self.local_build)
            .expanded_binhost_inheritance(self.expanded_binhost_inheritance)
            .use_cq_prebuilts(self.use_cq_prebuilts)
            .backtrack(self.backtrack)
            .binhost_lookup_service_data(self.binhost.load()?)
            .build())
    }
}

#[derive(Args, Debug)]
struct BuildPackagesArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Packages to build. Defaults to the packages of the selected images.
    packages: Vec<String>,

    /// Additional USE flag; may be repeated.
    #[arg(long = "use-flag", value_name = "FLAG")]
    use_flags: Vec<String>,

    /// Builds from source instead of using binary packages.
    #[arg(long)]
    nousepkg: bool,

    /// Fails rather than building a package that has no binary package.
    #[arg(long)]
    usepkgonly: bool,

    /// Uses binary packages from the local PKGDIR.
    #[arg(long)]
    local_pkg: bool,

    /// Shows what would be merged without merging anything.
    #[arg(long)]
    dryrun: bool,

    /// Doesn't build cros_workon packages from source.
    #[arg(long)]
    noworkon: bool,

    /// Skips the reverse dependency checks of modified packages.
    #[arg(long)]
    noincremental: bool,

    /// Switches the CPU governor to performance while building.
    #[arg(long)]
    autosetgov: bool,

    /// Keeps the performance governor after the build.
    #[arg(long)]
    autosetgov_sticky: bool,

    /// Doesn't accept any prebuilt Chrome.
    #[arg(long = "nouse-any-chrome")]
    no_use_any_chrome: bool,

    #[arg(long)]
    internal_chrome: bool,

    /// Keeps outdated binary packages.
    #[arg(long)]
    noeclean: bool,

    #[arg(long)]
    jobs: Option<u32>,

    #[arg(long = "nowithdev")]
    no_dev_image: bool,

    #[arg(long = "nowithfactory")]
    no_factory_image: bool,

    #[arg(long = "nowithtest")]
    no_test_image: bool,

    #[arg(long = "nowithautotest")]
    no_autotest: bool,

    /// Builds without debug assertions (USE=-cros-debug).
    #[arg(long = "nowithdebug")]
    no_debug: bool,

    #[arg(long, default_value_t = BACKTRACK_DEFAULT)]
    backtrack: u32,

    /// Builds with Bazel instead of emerge.
    #[arg(long)]
    bazel: bool,

    /// Builds only the packages a lite build needs. Implies --bazel.
    #[arg(long)]
    bazel_lite: bool,

    #[arg(long)]
    bazel_use_remote_execution: bool,

    /// Keeps the package build directories.
    #[arg(long)]
    skip_clean_package_dirs: bool,

    /// Compiles with remote execution using this reproxy config.
    #[arg(long, value_name = "FILE")]
    reproxy_cfg_file: Option<String>,

    /// Deadline of the whole build, in RFC 3339.
    #[arg(long, value_name = "TIME")]
    timeout: Option<DateTime<Utc>>,

    #[command(flatten)]
    binhost: BinhostArgs,
}

impl BuildPackagesArgs {
    fn run_config(&self) -> Result<BuildPackagesRunConfig> {
        Ok(BuildPackagesRunConfig {
            usepkg: !self.nousepkg,
            packages: (!self.packages.is_empty()).then(|| self.packages.clone()),
            use_flags: (!self.use_flags.is_empty()).then(|| self.use_flags.clone()),
            use_remoteexec: self.reproxy_cfg_file.is_some(),
            reproxy_cfg_file: self.reproxy_cfg_file.clone().unwrap_or_default(),
            incremental_build: !self.noincremental,
            dryrun: self.dryrun,
            usepkgonly: self.usepkgonly,
            workon: !self.noworkon,
            install_auto_test: !self.no_autotest,
            autosetgov: self.autosetgov,
            autosetgov_sticky: self.autosetgov_sticky,
            use_any_chrome: !self.no_use_any_chrome,
            internal_chrome: self.internal_chrome,
            eclean: !self.noeclean,
            jobs: self.jobs,
            local_pkg: self.local_pkg,
            dev_image: !self.no_dev_image,
            factory_image: !self.no_factory_image,
            test_image: !self.no_test_image,
            debug_version: !self.no_debug,
            backtrack: self.backtrack,
            bazel: self.bazel || self.bazel_lite,
            bazel_lite: self.bazel_lite,
            noclean: self.skip_clean_package_dirs,
            binhost_lookup_service_data: self.binhost.load()?,
            timeout: self
                .timeout
                .map(|deadline| deadline - Duration::minutes(TIMEOUT_MARGIN_MINUTES)),
            bazel_use_remote_execution: self.bazel_use_remote_execution,
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Creates a board sysroot and installs its toolchain.
    SetupBoard(SetupBoardArgs),
    /// Builds packages into an existing sysroot.
    BuildPackages(BuildPackagesArgs),
    /// Packages an artifact of a built sysroot.
    BundleArtifact {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, value_name = "KIND")]
        kind: ArtifactKind,

        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,
    },
    /// Creates a standalone sysroot tarball containing the given packages.
    GenerateArchive {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,

        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Unpacks a sysroot archive into the board's sysroot.
    ExtractArchive {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, value_name = "FILE")]
        archive: PathBuf,
    },
    /// Prints the binhosts the lookup service offers for the board, oldest
    /// first.
    LookupBinhosts {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        binhost: BinhostArgs,
    },
    /// Uploads the board's binary packages to Google Storage.
    UploadPrebuilts {
        #[command(flatten)]
        target: TargetArgs,

        /// gs:// location to upload to.
        #[arg(long, value_name = "URL")]
        remote_location: String,

        /// Defaults to the sysroot's packages directory.
        #[arg(long, value_name = "DIR")]
        package_dir: Option<PathBuf>,

        /// A tarball of the board to upload alongside the packages.
        #[arg(long, value_name = "FILE")]
        board_tarball: Option<PathBuf>,
    },
}

impl Commands {
    fn target(&self) -> &TargetArgs {
        match self {
            Commands::SetupBoard(args) => &args.target,
            Commands::BuildPackages(args) => &args.target,
            Commands::BundleArtifact { target, .. }
            | Commands::GenerateArchive { target, .. }
            | Commands::ExtractArchive { target, .. }
            | Commands::LookupBinhosts { target, .. }
            | Commands::UploadPrebuilts { target, .. } => target,
        }
    }

    /// Checks the arguments that can be checked without side effects.
    fn validate(&self) -> Result<()> {
        let target = self.target().build_target()?;
        match self {
            Commands::SetupBoard(args) => {
                args.run_config()?;
            }
            Commands::BuildPackages(args) => {
                args.run_config()?;
                ensure!(
                    target.root().exists(),
                    "Sysroot {} does not exist",
                    target.root().display()
                );
            }
            Commands::BundleArtifact { output_dir, .. } => {
                ensure!(
                    output_dir.is_dir(),
                    "Output directory {} does not exist",
                    output_dir.display()
                );
            }
            Commands::GenerateArchive { .. } => {}
            Commands::ExtractArchive { archive, .. } => {
                ensure!(archive.exists(), "Archive {} does not exist", archive.display());
            }
            Commands::LookupBinhosts { binhost, .. } => {
                binhost.load()?;
            }
            Commands::UploadPrebuilts {
                remote_location, ..
            } => {
                ensure!(
                    remote_location.starts_with("gs://"),
                    "--remote-location must be a gs:// URL"
                );
            }
        }
        Ok(())
    }
}

fn print_failed_package(package: &PackageInfo, log_path: Option<&Path>) {
    match log_path {
        Some(log_path) => println!("{}\t{}", package.cpvr(), log_path.display()),
        None => println!("{}", package.cpvr()),
    }
}

fn mock_response(mock: MockCall) -> Result<ReturnCode> {
    match mock {
        MockCall::Success => Ok(ReturnCode::Success),
        MockCall::Failure => {
            for (cpv, log) in [
                (
                    "category/package-1.0.0_rc-r1",
                    "/path/to/package:category-1.0.0_rc-r1:20210609-1337.log",
                ),
                ("foo/bar-3.7-r99", "/path/to/foo:bar-3.7-r99:20210609-1620.log"),
            ] {
                print_failed_package(&cpv.parse::<PackageInfo>()?, Some(Path::new(log)));
            }
            Ok(ReturnCode::UnsuccessfulResponseAvailable)
        }
        MockCall::Error => Ok(ReturnCode::Unrecoverable),
    }
}

fn run(ctx: &Context, command: &Commands) -> Result<ReturnCode> {
    let target = command.target().build_target()?;
    let target_sysroot = Sysroot::new(target.root());

    match command {
        Commands::SetupBoard(args) => {
            let run_configs = args.run_config()?;
            match sysroot::setup_board(ctx, &target, Some(ACCEPTED_LICENSES), &run_configs) {
                Ok(()) => {
                    println!("{}", target_sysroot.path().display());
                    Ok(ReturnCode::Success)
                }
                Err(Error::ToolchainInstall {
                    failed_packages,
                    source,
                }) => {
                    error!("Toolchain installation failed: {source}");
                    for package in &failed_packages {
                        print_failed_package(package, None);
                    }
                    Ok(ReturnCode::UnsuccessfulResponseAvailable)
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::BuildPackages(args) => {
            let run_configs = args.run_config()?;
            ensure!(
                target_sysroot.is_toolchain_installed()?,
                "Toolchain must first be installed"
            );
            match sysroot::build_packages(ctx, &target, &target_sysroot, &run_configs) {
                Ok(()) => Ok(ReturnCode::Success),
                Err(Error::PackageInstall(e)) => {
                    error!("{e}");
                    if e.failed_packages.is_empty() {
                        return Ok(ReturnCode::CompletedUnsuccessfully);
                    }
                    for failed in &e.failed_packages {
                        print_failed_package(&failed.package, failed.log_path.as_deref());
                    }
                    Ok(ReturnCode::UnsuccessfulResponseAvailable)
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::BundleArtifact {
            kind, output_dir, ..
        } => {
            let paths = sysroot::bundle(ctx, *kind, &target, &target_sysroot, output_dir)?;
            if paths.is_empty() {
                info!("No {kind} artifact was produced");
            }
            for path in paths {
                println!("{}", path.display());
            }
            Ok(ReturnCode::Success)
        }
        Commands::GenerateArchive {
            output_dir,
            packages,
            ..
        } => {
            let archive = sysroot::generate_archive(ctx, output_dir, &target, packages)?;
            println!("{}", archive.display());
            Ok(ReturnCode::Success)
        }
        Commands::ExtractArchive { archive, .. } => {
            match sysroot::extract_sysroot(ctx, &target_sysroot, archive)? {
                Some(path) => println!("{}", path.display()),
                None => info!(
                    "Sysroot {} does not exist; nothing extracted",
                    target_sysroot.path().display()
                ),
            }
            Ok(ReturnCode::Success)
        }
        Commands::LookupBinhosts { binhost, .. } => {
            let data = binhost.load()?;
            for url in ctx.binhost_lookup.lookup_binhosts(&target, data.as_ref())? {
                println!("{url}");
            }
            Ok(ReturnCode::Success)
        }
        Commands::UploadPrebuilts {
            remote_location,
            package_dir,
            board_tarball,
            ..
        } => {
            let prebuilts = BoardPrebuilts {
                package_dir: package_dir
                    .clone()
                    .unwrap_or_else(|| target_sysroot.join("packages")),
                remote_location: remote_location.clone(),
                board_tarball: board_tarball.clone(),
            };
            let url = sync_board_prebuilts(ctx.runner, &prebuilts, RetryPolicy::default())?;
            println!("{url}");
            Ok(ReturnCode::Success)
        }
    }
}

fn do_main() -> Result<ReturnCode> {
    let args = Cli::parse();

    if let Some(mock) = args.mock_call {
        return mock_response(mock);
    }
    args.command.validate()?;
    if args.validate_only {
        return Ok(ReturnCode::ValidInput);
    }

    let mut layout = Layout::default();
    if let Some(source_root) = args.source_root {
        layout.source_root = source_root;
    }
    let runner = SystemRunner;
    let host = RealHost::new(layout.chroot_version_file());
    let age_source = GsutilAgeSource::new(&runner);
    let binhost_lookup = ServiceBinhostLookup::new(&runner, layout.clone());
    let ctx = Context {
        runner: &runner,
        host: &host,
        binhost_lookup: &binhost_lookup,
        age_source: &age_source,
        layout,
        env: ProcessEnv::capture(),
    };
    run(&ctx, &args.command)
}

fn main() -> ExitCode {
    cli_main(do_main, Default::default())
}
