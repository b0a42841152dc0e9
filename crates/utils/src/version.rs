use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Image version, commit and dirty marker, e.g. `v0.2.1-3f9a2c1-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1.unwrap_or("unknown"),
        if BUILD_INFO.git_dirty { "-dirty" } else { "" }
    )
});

/// User agent sent to cloud APIs.
pub static USER_AGENT: LazyLock<String> =
    LazyLock::new(|| format!("AlibabaCloud/ERdma-Controller/{}", env!("IMAGE_VERSION")));
