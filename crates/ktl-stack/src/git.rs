use std::env;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Git identity of a stack root: the commit the declarations were taken
/// from and whether the working tree had local modifications.
///
/// Feeds the effective-input hash so a resumed run can tell whether the
/// stack sources changed underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitIdentity {
    pub commit: Option<String>,
    pub dirty: bool,
}

/// Collect the git identity for a stack root.
///
/// Returns `None` when the root is not inside a git repository (or git is
/// unavailable); a stack does not have to be version-controlled.
pub fn identity_for_root(root: &Path) -> Option<GitIdentity> {
    let in_repo = Command::new(git_program())
        .arg("rev-parse")
        .arg("--git-dir")
        .current_dir(root)
        .output()
        .ok()?;
    if !in_repo.status.success() {
        return None;
    }

    let commit = git_stdout(root, &["rev-parse", "HEAD"]);
    let dirty = git_stdout(root, &["status", "--porcelain"])
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    Some(GitIdentity { commit, dirty })
}

fn git_stdout(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(git_program())
        .args(args)
        .current_dir(root)
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

fn git_program() -> String {
    env::var("KTL_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::path::{Path, PathBuf};

    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    struct EnvGuard {
        key: String,
        old: Option<String>,
    }

    impl EnvGuard {
        #[allow(unsafe_code)]
        fn set(key: &str, value: &str) -> Self {
            let old = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self {
                key: key.to_string(),
                old,
            }
        }
    }

    impl Drop for EnvGuard {
        #[allow(unsafe_code)]
        fn drop(&mut self) {
            if let Some(v) = &self.old {
                unsafe { env::set_var(&self.key, v) };
            } else {
                unsafe { env::remove_var(&self.key) };
            }
        }
    }

    #[cfg(unix)]
    fn write_fake_git(bin_dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = bin_dir.join("git");
        fs::write(&path, body).expect("write fake git");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn identity_is_none_outside_a_repo() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake = write_fake_git(&bin, "#!/usr/bin/env sh\nexit 1\n");
        let _guard = EnvGuard::set("KTL_GIT_BIN", fake.to_str().expect("utf8"));

        assert!(identity_for_root(td.path()).is_none());
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn identity_reports_commit_and_clean_tree() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake = write_fake_git(
            &bin,
            "#!/usr/bin/env sh\nif [ \"$1\" = \"rev-parse\" ]; then\n  if [ \"$2\" = \"--git-dir\" ]; then exit 0; fi\n  if [ \"$2\" = \"HEAD\" ]; then echo abc123; exit 0; fi\nfi\nif [ \"$1\" = \"status\" ]; then exit 0; fi\nexit 1\n",
        );
        let _guard = EnvGuard::set("KTL_GIT_BIN", fake.to_str().expect("utf8"));

        let identity = identity_for_root(td.path()).expect("identity");
        assert_eq!(identity.commit.as_deref(), Some("abc123"));
        assert!(!identity.dirty);
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn identity_flags_a_dirty_tree() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake = write_fake_git(
            &bin,
            "#!/usr/bin/env sh\nif [ \"$1\" = \"rev-parse\" ]; then\n  if [ \"$2\" = \"--git-dir\" ]; then exit 0; fi\n  if [ \"$2\" = \"HEAD\" ]; then echo abc123; exit 0; fi\nfi\nif [ \"$1\" = \"status\" ]; then echo 'M stack.yaml'; exit 0; fi\nexit 1\n",
        );
        let _guard = EnvGuard::set("KTL_GIT_BIN", fake.to_str().expect("utf8"));

        let identity = identity_for_root(td.path()).expect("identity");
        assert!(identity.dirty);
    }
}
