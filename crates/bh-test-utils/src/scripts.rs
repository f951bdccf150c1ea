//! Fake service executables: shell scripts dropped into a temp libexec.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script named like a service.  `body` is
/// everything after the shebang.
pub fn write_service_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write service script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("mark service script executable");
    path
}
