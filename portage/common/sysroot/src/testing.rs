// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use testutil::FakeRunner;

use crate::{
    binhost::{BinhostAgeSource, NoBinhostLookup},
    chroot::Host,
    context::Context,
    layout::Layout,
    run_config::ProcessEnv,
};

#[derive(Default)]
pub struct FakeHost {
    pub outside_chroot: bool,
    pub root: bool,
}

impl Host for FakeHost {
    fn is_inside_chroot(&self) -> bool {
        !self.outside_chroot
    }

    fn is_root_user(&self) -> bool {
        self.root
    }
}

pub struct OfflineAgeSource;

impl BinhostAgeSource for OfflineAgeSource {
    fn index_created(&self, binhost: &str) -> Result<DateTime<Utc>> {
        bail!("offline: {binhost}")
    }
}

pub fn context<'a>(runner: &'a FakeRunner, host: &'a FakeHost, layout: Layout) -> Context<'a> {
    Context {
        runner,
        host,
        binhost_lookup: &NoBinhostLookup,
        age_source: &OfflineAgeSource,
        layout,
        env: ProcessEnv::default(),
    }
}
