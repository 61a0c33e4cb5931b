use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    println!(
        "cargo:rustc-env=TERMRELAY_GIT_SHA={}",
        git_sha().unwrap_or_default()
    );
    println!("cargo:rustc-env=TERMRELAY_BUILD_TIME={}", build_time());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-env-changed=TERMRELAY_GIT_SHA");
}

fn git_sha() -> Option<String> {
    if let Some(value) = non_empty_env("TERMRELAY_GIT_SHA").or_else(|| non_empty_env("GITHUB_SHA"))
    {
        return Some(value.chars().take(7).collect());
    }
    if !Path::new(".git").exists() {
        return None;
    }
    let sha = git(&["rev-parse", "--short", "HEAD"])?;
    let dirty = git(&["status", "--porcelain"]).is_some();
    Some(if dirty { format!("{sha}-dirty") } else { sha })
}

/// Honors SOURCE_DATE_EPOCH for reproducible builds.
fn build_time() -> String {
    let rfc3339 = &time::format_description::well_known::Rfc3339;
    let timestamp = non_empty_env("SOURCE_DATE_EPOCH")
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|epoch| time::OffsetDateTime::from_unix_timestamp(epoch).ok())
        .unwrap_or_else(time::OffsetDateTime::now_utc);
    timestamp
        .format(rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
