use std::{fs, path::Path, process::Command, time::SystemTime};

fn main() {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    println!("cargo:rustc-env=BUILD_TIME={}", now);

    println!("cargo:rerun-if-changed=.git/HEAD");
    if Path::new(".git/refs/heads").exists() {
        println!("cargo:rerun-if-changed=.git/refs/heads");
    }

    let git = GitInfo::collect();
    println!("cargo:rustc-env=GIT_BRANCH={}", git.branch);
    println!("cargo:rustc-env=GIT_COMMIT={}", git.commit);
    println!("cargo:rustc-env=GIT_COMMIT_TIME={}", git.commit_time);
}

struct GitInfo {
    branch: String,
    commit: String,
    commit_time: u64,
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}

impl GitInfo {
    fn collect() -> Self {
        let mut info = Self {
            branch: git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_else(|| "unknown".into()),
            commit: git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".into()),
            commit_time: git(&["show", "-s", "--format=%ct", "HEAD"])
                .and_then(|s| s.parse::<u64>().ok())
                .map(|t| t * 1000)
                .unwrap_or(0),
        };

        // No git binary: read .git directly.
        if info.commit == "unknown" {
            if let Ok(head) = fs::read_to_string(".git/HEAD") {
                match head.strip_prefix("ref: ") {
                    Some(reference) => {
                        let reference = reference.trim();
                        info.branch = reference.rsplit('/').next().unwrap_or("unknown").to_string();
                        if let Ok(commit) = fs::read_to_string(format!(".git/{}", reference)) {
                            info.commit = commit.trim().to_string();
                        }
                    }
                    None => info.commit = head.trim().to_string(),
                }
            }
        }

        info
    }
}
