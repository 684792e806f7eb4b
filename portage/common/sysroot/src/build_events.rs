// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The subset of Bazel's JSON build event protocol needed to find failed
//! ebuild actions.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionCompletedId {
    #[serde(default)]
    pub label: String,
    pub primary_output: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildEventId {
    pub action_completed: Option<ActionCompletedId>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecuted {
    pub exit_code: Option<i32>,
    pub failure_detail: Option<FailureDetail>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    #[serde(default)]
    pub id: BuildEventId,
    pub action: Option<ActionExecuted>,
}

impl BuildEvent {
    /// The completed action's ID if this event reports a failed action.
    pub fn failed_action(&self) -> Option<&ActionCompletedId> {
        let completed = self.id.action_completed.as_ref()?;
        self.action.as_ref()?.failure_detail.as_ref()?;
        Some(completed)
    }
}

/// Reads a newline-delimited JSON build event file. Blank lines are skipped.
pub fn load_build_events_jsonl(path: &Path) -> Result<Vec<BuildEvent>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: BuildEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid build event", path.display(), index + 1))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_failed_actions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        let lines = [
            json!({"id": {"started": {}}, "started": {"uuid": "x"}}),
            json!({
                "id": {"actionCompleted": {
                    "primaryOutput": "bazel-out/k8-fastbuild/bin/chrome-icu/chrome-icu-122.0_rc-r1.tbz2",
                    "label": "@@_main~portage~portage//internal/packages/stage1/target/board/chromiumos/chromeos-base/chrome-icu:122.0_rc-r1",
                    "configuration": {"id": "abc"}
                }},
                "action": {
                    "exitCode": 1,
                    "type": "Ebuild",
                    "failureDetail": {"message": "local spawn failed for Ebuild", "spawn": {"code": "NON_ZERO_EXIT"}}
                }
            }),
            json!({
                "id": {"actionCompleted": {"label": "@@_main~portage~portage//foo/bar/baz:1"}},
                "action": {"exitCode": 0}
            }),
        ];
        let content = lines.iter().map(|l| l.to_string()).collect::<Vec<_>>().join("\n\n");
        std::fs::write(&path, content)?;

        let events = load_build_events_jsonl(&path)?;
        assert_eq!(events.len(), 3);

        let failed: Vec<_> = events.iter().filter_map(BuildEvent::failed_action).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].label.ends_with("chromeos-base/chrome-icu:122.0_rc-r1"));
        assert_eq!(
            failed[0].primary_output.as_deref(),
            Some("bazel-out/k8-fastbuild/bin/chrome-icu/chrome-icu-122.0_rc-r1.tbz2")
        );
        Ok(())
    }

    #[test]
    fn rejects_garbage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.json");
        std::fs::write(&path, "{not json")?;
        assert!(load_build_events_jsonl(&path).is_err());
        Ok(())
    }
}
