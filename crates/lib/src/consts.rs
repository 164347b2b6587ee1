//! Names and file layout constants shared across the crate.

pub const APP_NAME: &str = "strata";

/// Build file looked up in the workspace root.
pub const BUILD_FILE_NAME: &str = "strata.toml";

/// Directory under the output root holding persisted engine state.
pub const STATE_DIR: &str = ".strata";

pub const CACHE_DIR: &str = "cache";
pub const RELEASE_DIR: &str = "release";
pub const DISTRIBUTIONS_DIR: &str = "distributions";
pub const STAGING_REPO_DIR: &str = "staging-repo";

/// Name of the distribution assembly task on the root project.
pub const ASSEMBLE_TASK: &str = "assembleDist";

/// Version stamp written at the top of every distribution.
pub const VERSION_FILE: &str = "VERSION";

pub const CHECKSUMS_FILE: &str = "checksums.txt";

/// Default key file name, looked up in `~/.strata/`.
pub const SIGNING_KEY_FILE: &str = "signing-key.asc";

/// Length of the hash prefix used in short fingerprint displays.
pub const SHORT_HASH_LEN: usize = 12;
