//! ONNX Runtime and GPU library discovery.
//!
//! `ort` is built with `load-dynamic`, so the shared library is located at
//! run time. [`setup_runtime_libs`] must run before the first session is
//! created and before tracing is initialized; it returns a [`RuntimeLibs`]
//! summary that can be logged once a subscriber exists.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Dependency tier of a GPU runtime library. Lower tiers load first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LibTier {
    Cuda,
    Cudnn,
    TensorRt,
}

impl LibTier {
    /// Classify a library file name. ONNX Runtime's own provider libraries are
    /// not preloaded: they need symbols from the main runtime, which `ort`
    /// loads later.
    pub fn classify(file_name: &str) -> Option<Self> {
        let name = file_name.to_ascii_lowercase();
        let cuda: &[&str] = if cfg!(windows) {
            &["cudart64_", "cublas64_", "cublaslt64_"]
        } else {
            &["libcudart", "libcublas", "libcufft", "libcurand"]
        };
        let cudnn: &[&str] = if cfg!(windows) { &["cudnn64_"] } else { &["libcudnn"] };
        let trt: &[&str] = if cfg!(windows) {
            &["nvinfer", "nvonnxparser"]
        } else {
            &["libnvinfer", "libnvonnxparser"]
        };

        if cuda.iter().any(|p| name.starts_with(p)) {
            Some(Self::Cuda)
        } else if cudnn.iter().any(|p| name.starts_with(p)) {
            Some(Self::Cudnn)
        } else if trt.iter().any(|p| name.starts_with(p)) {
            Some(Self::TensorRt)
        } else {
            None
        }
    }
}

/// Outcome of runtime library discovery.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLibs {
    pub searched: Vec<PathBuf>,
    /// Set when discovery filled in `ORT_DYLIB_PATH`.
    pub discovered_ort: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed in order: next to the executable (Windows), its
/// `lib/` and `../lib/`, `./lib`, then the system library directories.
pub fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(exe_dir) = env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        if cfg!(windows) {
            push(exe_dir.clone());
        }
        push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    if cfg!(unix) {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

pub fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// GPU libraries found in `dirs`, sorted into load order. The first
/// directory holding a given file name wins.
pub fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<(LibTier, PathBuf)> {
    let mut seen = HashSet::new();
    let mut libs = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(tier) = LibTier::classify(&name) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(tier, _, path)| (tier, path)).collect()
}

fn is_shared_lib(name: &str, path: &Path) -> bool {
    if cfg!(windows) {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// Load a library globally and keep it mapped for the life of the process.
///
/// glibc reads `LD_LIBRARY_PATH` once at startup, so later dlopen calls by
/// ONNX Runtime only find these libraries if they are already resident.
#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: loading a library runs its initializers; only CUDA, cuDNN and
    // TensorRT libraries selected by `LibTier::classify` reach this point.
    let lib = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    match lib {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn prepend_to_path(dirs: &[PathBuf]) {
    let mut merged: Vec<PathBuf> = dirs.iter().filter(|d| d.is_dir()).cloned().collect();
    if let Some(current) = env::var_os("PATH") {
        merged.extend(env::split_paths(&current).filter(|d| !d.as_os_str().is_empty()));
    }
    let mut seen = HashSet::new();
    merged.retain(|d| seen.insert(d.to_string_lossy().to_ascii_lowercase()));
    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

/// Point `ort` at a bundled runtime and preload GPU libraries.
pub fn setup_runtime_libs() -> RuntimeLibs {
    let dirs = candidate_lib_dirs();
    let mut libs = RuntimeLibs::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            libs.discovered_ort = Some(path);
        }
        #[cfg(windows)]
        prepend_to_path(&dirs);
    }

    for (_, path) in collect_preload_libs(&dirs) {
        if preload(&path) {
            libs.preloaded.push(path);
        }
    }
    libs.searched = dirs;
    libs
}

impl RuntimeLibs {
    /// Log the resolved libraries. Call after tracing is initialized.
    pub fn log_status(&self) {
        match env::var(ORT_DYLIB_ENV) {
            Ok(ort) if Path::new(&ort).is_file() => {
                info!(path = %ort, discovered = self.discovered_ort.is_some(), "ONNX Runtime library");
            }
            Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
            Err(_) => warn!(
                searched = self.searched.len(),
                "{ORT_DYLIB_ENV} not set, ONNX Runtime will use default search paths"
            ),
        }
        for path in &self.preloaded {
            debug!(path = %path.display(), "Preloaded GPU runtime library");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_candidate_dirs_end_with_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn test_candidate_dirs_include_cwd_lib_once() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            let lib = cwd.join("lib");
            assert_eq!(dirs.iter().filter(|d| **d == lib).count(), 1);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_tiers_order_cuda_before_cudnn_before_tensorrt() {
        assert_eq!(LibTier::classify("libcudart.so.12"), Some(LibTier::Cuda));
        assert_eq!(LibTier::classify("libcublasLt.so.12"), Some(LibTier::Cuda));
        assert_eq!(LibTier::classify("libcudnn_ops.so.9"), Some(LibTier::Cudnn));
        assert_eq!(LibTier::classify("libnvinfer.so.10"), Some(LibTier::TensorRt));
        assert!(LibTier::Cuda < LibTier::Cudnn && LibTier::Cudnn < LibTier::TensorRt);
    }

    #[cfg(unix)]
    #[test]
    fn test_onnxruntime_providers_are_not_preloaded() {
        assert_eq!(LibTier::classify("libonnxruntime.so.1.23.2"), None);
        assert_eq!(LibTier::classify("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(LibTier::classify("libz.so.1"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_preload_list_is_sorted_and_deduplicated() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libcudart.so.12", "notes.txt"] {
            std::fs::write(first.join(name), b"").expect("write lib");
        }
        std::fs::write(second.join("libcudart.so.12"), b"").expect("write duplicate");

        let libs = collect_preload_libs(&[first.clone(), second]);
        let tiers: Vec<LibTier> = libs.iter().map(|(t, _)| *t).collect();
        assert_eq!(tiers, vec![LibTier::Cuda, LibTier::Cudnn, LibTier::TensorRt]);
        assert_eq!(libs[0].1, first.join("libcudart.so.12"));
    }

    #[test]
    fn test_find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).expect("dir a");
        std::fs::create_dir_all(&b).expect("dir b");
        std::fs::write(b.join(ORT_LIB_NAME), b"").expect("write b");
        assert_eq!(find_ort_dylib(&[a.clone(), b.clone()]), Some(b.join(ORT_LIB_NAME)));
        std::fs::write(a.join(ORT_LIB_NAME), b"").expect("write a");
        assert_eq!(find_ort_dylib(&[a.clone(), b]), Some(a.join(ORT_LIB_NAME)));
    }
}
