//! C code compilation with Quake 3's lcc compiler.
//!
//! The compiler itself is an external executable; this module only locates it, drives it, and
//! collects its output. lcc is asked to emit intermediate bytecode assembly (`-S
//! -Wf-target=bytecode`), which the [`assembler`](crate::assembler) then lowers.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use snafu::prelude::*;

/// Error conditions for when running the external compiler.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown when no lcc executable could be found.
    #[snafu(display(
        "Unable to locate lcc. Set the LCC environment variable or make sure it is in your PATH."
    ))]
    NotFound,

    /// Thrown when lcc exits unsuccessfully; carries its combined stdout and stderr.
    #[snafu(display("lcc failed:\n{output}"))]
    Failed { output: String },

    #[snafu(display("Filesystem Error {source}"))]
    FileError { source: std::io::Error },
}
type Result<T> = core::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Error::FileError { source: error }
    }
}

/// A handle to the lcc executable.
#[derive(Clone, Debug)]
pub struct Lcc {
    path: PathBuf,
}

impl Lcc {
    /// Uses the given executable directly, skipping discovery.
    #[inline]
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Tries to find lcc: the `LCC` environment variable first, then `lcc`/`q3lcc` in the
    /// current directory and on PATH, then the conventional Windows install locations.
    #[must_use]
    pub fn locate() -> Option<Self> {
        if let Some(path) = env::var_os("LCC") {
            return Some(Self::from_path(PathBuf::from(path)));
        }

        for name in ["lcc", "q3lcc"] {
            if let Some(path) = find_executable(name) {
                return Some(Self::from_path(path));
            }
        }

        #[cfg(windows)]
        for bin_dir in ["bin_nt", "bin"] {
            let path: PathBuf = ["C:\\", "quake3", bin_dir, "lcc.exe"].iter().collect();
            if path.is_file() {
                return Some(Self::from_path(path));
            }
        }

        None
    }

    /// Returns the path of the executable this handle will run.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compiles a C file into lcc bytecode assembly, written to `output`.
    ///
    /// Returns the compiler's standard output/error.
    ///
    /// # Errors
    /// Returns [`Failed`](Error::Failed) with the compiler's combined output if it exits
    /// unsuccessfully, or [`FileError`](Error::FileError) if it cannot be started.
    pub fn compile_file(
        &self,
        input: &Path,
        output: &Path,
        include_dirs: &[PathBuf],
    ) -> Result<String> {
        let mut command = Command::new(&self.path);
        command.args(["-DQ3_VM", "-S", "-Wf-target=bytecode", "-Wf-g"]);
        for include_dir in include_dirs {
            command.arg(format!("-I{}", include_dir.display()));
        }
        command.arg("-o").arg(output).arg(input);

        // make sure lcc can find the other executables it needs
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            let parent = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
            let mut paths = vec![parent];
            if let Some(existing) = env::var_os("PATH") {
                paths.extend(env::split_paths(&existing));
            }
            if let Ok(joined) = env::join_paths(paths) {
                command.env("PATH", joined);
            }
        }

        log::debug!("running {:?}", command);
        let result = command.output()?;
        let mut combined = String::from_utf8_lossy(&result.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&result.stderr));

        ensure!(result.status.success(), FailedSnafu { output: combined });
        Ok(combined)
    }
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let mut directories = Vec::new();
    if let Ok(current) = env::current_dir() {
        directories.push(current);
    }
    if let Some(path) = env::var_os("PATH") {
        directories.extend(env::split_paths(&path));
    }

    for directory in directories {
        let candidate = directory.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = directory.join(format!("{name}.exe"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

/// A file in the system temp directory that is removed again when the handle drops, no matter
/// how the compilation attempt ends.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Creates an empty scratch file with the given suffix.
    pub fn create(suffix: &str) -> std::io::Result<Self> {
        Self::with_contents(suffix, &[])
    }

    /// Creates a scratch file holding `contents`.
    pub fn with_contents(suffix: &str, contents: &[u8]) -> std::io::Result<Self> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = env::temp_dir().join(format!(
            "qforge-{}-{unique}{suffix}",
            std::process::id()
        ));
        std::fs::write(&path, contents)?;
        Ok(Self { path })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_files_clean_up_after_themselves() {
        let path = {
            let scratch = ScratchFile::with_contents(".c", b"int x;").unwrap();
            assert_eq!(std::fs::read(scratch.path()).unwrap(), b"int x;");
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn missing_compiler_reports_output() {
        let lcc = Lcc::from_path("/nonexistent/lcc");
        let error = lcc
            .compile_file(Path::new("in.c"), Path::new("out.asm"), &[])
            .unwrap_err();
        assert!(matches!(error, Error::FileError { .. }));
    }
}
