use crate::collab::{BuildAction, BuildSystem};
use crate::command::LaunchCommand;
use crate::report::Reporter;
use std::fs;
use std::path::{Path, PathBuf};

const STAGE: &str = "clean_artifacts";

const ARTIFACT_SUFFIXES: [&str; 2] = [".recipe.used", ".csv"];
const LOG_DIR_PREFIX: &str = ".habana_logs";

/// Removes build outputs, runtime logs and result files of earlier runs.
/// Problems are reported and skipped; cleaning never fails a run.
pub fn clean_artifacts(
    working_dir: &Path,
    home: Option<&Path>,
    build: &dyn BuildSystem,
    prefix: Option<&LaunchCommand>,
    reporter: &dyn Reporter,
) -> Vec<PathBuf> {
    match build.build(BuildAction::Clean, prefix) {
        Ok(0) => {}
        Ok(code) => reporter.warn(STAGE, &format!("build clean exited with code {}", code)),
        Err(e) => reporter.warn(STAGE, &format!("build clean failed: {:#}", e)),
    }

    let mut removed = Vec::new();
    if let Some(home) = home {
        removed.extend(remove_matching(home, reporter, |name| name.starts_with(LOG_DIR_PREFIX)));
    }
    removed.extend(remove_matching(working_dir, reporter, |name| {
        ARTIFACT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }));
    removed
}

fn remove_matching(
    dir: &Path,
    reporter: &dyn Reporter,
    matches: impl Fn(&str) -> bool,
) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            reporter.warn(STAGE, &format!("cannot list {}: {}", dir.display(), e));
            return Vec::new();
        }
    };
    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches(name) {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                reporter.debug(STAGE, &format!("cleaning: {}", path.display()));
                removed.push(path);
            }
            Err(e) => reporter.warn(STAGE, &format!("cannot remove {}: {}", path.display(), e)),
        }
    }
    removed.sort();
    removed
}
