// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use processes::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use std::sync::Mutex;

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync>;

/// A [`CommandRunner`] that records every command and answers from a script.
///
/// Rules are tried in registration order; commands matching no rule succeed
/// with empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(Matcher, Handler)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

/// Matches commands whose program's file name is `name`.
pub fn program(name: &'static str) -> impl Fn(&CommandSpec) -> bool + Send + Sync {
    move |spec| spec.program.rsplit('/').next() == Some(name)
}

/// Matches commands whose program is `name` and whose arguments include `arg`.
pub fn program_with_arg(
    name: &'static str,
    arg: &'static str,
) -> impl Fn(&CommandSpec) -> bool + Send + Sync {
    let is_program = program(name);
    move |spec| is_program(spec) && spec.has_arg(arg)
}

/// Builds the error a command exiting with `code` produces.
pub fn failure(spec: &CommandSpec, code: i32) -> CommandError {
    CommandError::Failed {
        command: spec.to_string(),
        output: CommandOutput {
            code: Some(code),
            ..Default::default()
        },
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers matching commands with `handler`.
    pub fn on(
        &self,
        matcher: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        handler: impl Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    ) -> &Self {
        self.rules
            .lock()
            .unwrap()
            .push((Box::new(matcher), Box::new(handler)));
        self
    }

    /// Answers matching commands with a successful exit and `stdout`.
    pub fn stdout(
        &self,
        matcher: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        stdout: &str,
    ) -> &Self {
        let stdout = stdout.to_owned();
        self.on(matcher, move |_| {
            Ok(CommandOutput {
                code: Some(0),
                stdout: stdout.clone(),
                stderr: String::new(),
            })
        })
    }

    /// Makes matching commands exit with `code`.
    pub fn fail(
        &self,
        matcher: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        code: i32,
    ) -> &Self {
        self.on(matcher, move |spec| Err(failure(spec, code)))
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// The commands run so far whose program's file name is `name`.
    pub fn calls_to(&self, name: &'static str) -> Vec<CommandSpec> {
        let is_program = program(name);
        self.calls().into_iter().filter(|c| is_program(c)).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        let rules = self.rules.lock().unwrap();
        match rules.iter().find(|(matcher, _)| matcher(spec)) {
            Some((_, handler)) => handler(spec),
            None => Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            }),
        }
    }

    fn run_detached(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        self.run(spec).map(|_| ())
    }
}
