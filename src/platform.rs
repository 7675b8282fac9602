/// Runs a blocking closure off the async executor.
#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    _ = tokio::task::spawn_blocking(f);
}

/// Runs a blocking closure in place; there are no blocking threads on the web.
#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + 'static,
{
    f()
}

/// Operating system part of the platform tag.
#[inline]
fn os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macosx",
        os => os,
    }
}

/// Architecture part of the platform tag.
#[inline]
fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64le",
        arch => arch,
    }
}

/// The tag naming this platform inside packaged library paths, e.g. `linux-x86_64`.
pub fn tag() -> String {
    format!("{}-{}", os(), arch())
}
