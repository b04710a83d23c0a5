//! Shared helpers for module tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

/// Write an executable shell script into `dir` and return its path.
///
/// Used to stand in for the external `tsh` tool in tests.
pub fn stub_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A stub that answers both `ls` (printing the given nodes) and `ssh`
/// (staying alive until killed), mimicking the real tool's two roles.
pub fn stub_tsh(dir: &TempDir, nodes: &[&str]) -> PathBuf {
    let list = nodes
        .iter()
        .map(|n| format!("echo {n}"))
        .collect::<Vec<_>>()
        .join("\n");
    stub_script(
        dir,
        "tsh",
        &format!(
            "case \"$1\" in\n  ls) {list_body} ;;\n  ssh) exec sleep 300 ;;\n  *) exit 1 ;;\nesac\n",
            list_body = if list.is_empty() {
                ":".to_string()
            } else {
                list.replace('\n', "; ")
            }
        ),
    )
}
