//! ONNX Runtime and CUDA shared-library discovery.
//!
//! Runs before ORT is touched: points `ORT_DYLIB_PATH` at a bundled
//! onnxruntime and preloads the CUDA, cuDNN and TensorRT libraries found next
//! to the executable so the execution providers can resolve them.

use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found. Logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub search_dirs: Vec<PathBuf>,
    /// `ORT_DYLIB_PATH` as set by this process or inherited.
    pub ort_dylib: Option<PathBuf>,
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Searches, in order: `<exe_dir>/` (Windows only), `<exe_dir>/lib/`,
/// `<exe_dir>/../lib/`, `<cwd>/lib/`, then `/usr/local/lib/` and `/usr/lib/`
/// on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn normalize_windows_path_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .to_ascii_lowercase()
}

#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs.iter().filter(|dir| dir.is_dir()) {
        if seen.insert(normalize_windows_path_key(dir)) {
            merged.push(dir.clone());
        }
    }

    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if !dir.as_os_str().is_empty() && seen.insert(normalize_windows_path_key(&dir)) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

/// Load order tier for GPU runtime libraries; `None` means do not preload.
///
/// ORT's own provider libraries are skipped: they need symbols from
/// onnxruntime itself, which the ort crate loads later.
///
///   0 - CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1 - cuDNN
///   2 - TensorRT (nvinfer, nvonnxparser)
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Libraries to preload, in dependency order.
///
/// The first directory holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

// glibc caches LD_LIBRARY_PATH at startup, so libraries are opened by
// absolute path with RTLD_GLOBAL instead.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Configure runtime library paths. Call first thing in `main()`, before any
/// ORT or tracing initialization.
pub fn setup_runtime_libs() -> RuntimeLibs {
    let dirs = candidate_lib_dirs();
    let inherited = env::var_os("ORT_DYLIB_PATH").map(PathBuf::from);
    let ort_from_env = inherited.is_some();

    let ort_dylib = match inherited {
        Some(path) => Some(path),
        None => {
            let found = find_ort_dylib_in_dirs(&dirs);
            if let Some(path) = &found {
                env::set_var("ORT_DYLIB_PATH", path);
            }
            #[cfg(windows)]
            env::set_var("PATH", build_path_with_prepended_dirs(env::var_os("PATH"), &dirs));
            found
        }
    };

    let preloaded = preload_plan(&dirs)
        .into_iter()
        .filter(|path| unsafe { load_library(path) })
        .collect();

    RuntimeLibs {
        search_dirs: dirs,
        ort_dylib,
        ort_from_env,
        preloaded,
    }
}

/// Log which runtime libraries were resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match &libs.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = libs.ort_from_env,
            "ORT library"
        ),
        Some(path) => warn!(path = %path.display(), "ORT_DYLIB_PATH points to a missing file"),
        None => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }
    debug!(
        preloaded = libs.preloaded.len(),
        search_dirs = libs.search_dirs.len(),
        "GPU runtime libraries preloaded"
    );
    for path in &libs.preloaded {
        debug!(path = %path.display(), "Preloaded runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );
        std::fs::write(first.join(ORT_LIB_NAME), b"").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_orders_by_tier_and_dedups() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libcudart.so.12", "libpng.so"] {
            std::fs::write(a.join(name), b"").unwrap();
        }
        std::fs::write(b.join("libcudart.so.12"), b"").unwrap();

        let plan = preload_plan(&[a.clone(), b]);
        assert_eq!(
            plan,
            vec![
                a.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libsomething_else.so"), None);
    }

    #[cfg(windows)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("cudart64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("cudnn64_9.dll") < load_priority("nvinfer.dll"));
        assert_eq!(load_priority("onnxruntime.dll"), None);
    }

    #[cfg(windows)]
    #[test]
    fn build_path_with_prepended_dirs_prefers_candidate_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let preferred = temp.path().join("preferred-lib");
        let existing = temp.path().join("existing");
        std::fs::create_dir_all(&preferred).unwrap();
        std::fs::create_dir_all(&existing).unwrap();

        let current = env::join_paths([existing.clone(), preferred.clone()]).unwrap();
        let merged = build_path_with_prepended_dirs(Some(current), &[preferred.clone()]);
        let dirs: Vec<PathBuf> = env::split_paths(&merged).collect();
        assert_eq!(dirs, vec![preferred, existing]);
    }
}
