/// Crate version without build metadata, reported by `/health`.
pub const SHORT_VERSION: &str = env!("CARGO_PKG_VERSION");

const GIT_SHA: &str = env!("TERMRELAY_GIT_SHA");

/// Long version shown by `--version`.
pub const VERSION: &str = if GIT_SHA.is_empty() {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (built ",
        env!("TERMRELAY_BUILD_TIME"),
        ")"
    )
} else {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (git ",
        env!("TERMRELAY_GIT_SHA"),
        ", built ",
        env!("TERMRELAY_BUILD_TIME"),
        ")"
    )
};
