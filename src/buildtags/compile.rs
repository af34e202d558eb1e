//! The Go compile gate: `go test -c` over the solver-selected sibling
//! set, with stderr filtered down to the errors that matter.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::exec::{CommandInput, ExecEnvironment};

use super::select_compile_files;

/// stderr lines containing any of these substrings fail the gate; other
/// compiler chatter (vet notes, module warnings) is tolerated.
pub const COMPILE_ERROR_BLACKLIST: &[&str] = &[
    "syntax error:",
    "already declared at",
    "redeclared in this block",
    "other declaration of",
    "imports must appear before other declarations",
    "EOF",
];

/// Test-compile the package around `relative_path` inside `env`.
///
/// Returns `Ok(None)` when the gate passes and `Ok(Some(message))` with
/// the blacklisted stderr lines when it doesn't. A missing `go` binary or
/// an unreadable directory is a hard error.
pub async fn check_go_compile(
    env: &ExecEnvironment,
    relative_path: &str,
) -> anyhow::Result<Option<String>> {
    let root = env.working_directory();
    let target = root.join(relative_path);
    let dir = target
        .parent()
        .context("target file has no parent directory")?
        .to_path_buf();

    let siblings = go_siblings(&dir)?;
    let selected = select_compile_files(&target, &siblings)?;

    // go wants plain file names when compiling a file list; run with the
    // file's directory as the working dir.
    let relative_dir = Path::new(relative_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let out_path = std::env::temp_dir().join(format!("sidekick-compile-{}", std::process::id()));
    let mut args: Vec<String> = vec![
        "test".into(),
        "-c".into(),
        "-o".into(),
        out_path.to_string_lossy().into_owned(),
    ];
    for file in &selected {
        let name = file
            .file_name()
            .context("selected file has no name")?
            .to_string_lossy()
            .into_owned();
        args.push(name);
    }

    let mut input = CommandInput::new("go", args);
    input.relative_working_dir = relative_dir;
    let output = env.run_command(&input).await?;
    let _ = std::fs::remove_file(&out_path);

    let flagged: Vec<&str> = output
        .stderr
        .lines()
        .filter(|line| COMPILE_ERROR_BLACKLIST.iter().any(|bad| line.contains(bad)))
        .collect();
    if flagged.is_empty() {
        Ok(None)
    } else {
        Ok(Some(flagged.join("\n")))
    }
}

/// All `.go` files in `dir`, sorted by name for deterministic selection.
fn go_siblings(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "go"))
        .collect();
    files.sort();
    Ok(files)
}
