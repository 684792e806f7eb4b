// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use processes::CommandRunner;

use crate::{
    binhost::{BinhostAgeSource, BinhostLookup},
    chroot::Host,
    layout::Layout,
    run_config::ProcessEnv,
};

/// Everything the orchestration talks to outside of its arguments.
///
/// The CLI wires up the real implementations; tests substitute fakes.
pub struct Context<'a> {
    pub runner: &'a dyn CommandRunner,
    pub host: &'a dyn Host,
    pub binhost_lookup: &'a dyn BinhostLookup,
    pub age_source: &'a dyn BinhostAgeSource,
    pub layout: Layout,
    pub env: ProcessEnv,
}
