use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use dynkernel::{CompilerConfig, KernelCompiler};

/// Prefix of every image the succeeding toolchain writes, followed by the staged source.
pub const FAKE_IMAGE_MAGIC: &[u8] = b"FAKEBIN\n";

static NEXT_SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// Shell script standing in for the device compiler.
///
/// The script is run through `sh` rather than executed directly so tests never race a freshly
/// written executable. Every invocation records its arguments one per line.
pub struct FakeToolchain {
    dir: PathBuf,
    script: PathBuf,
    log: PathBuf,
}

impl FakeToolchain {
    /// Toolchain that writes `FAKE_IMAGE_MAGIC` plus the staged source to the `-o` path.
    pub fn succeeding(name: &str) -> io::Result<Self> {
        Self::with_body(name, |log| {
            format!(
                r#"printf '%s\n' "$@" > '{log}'
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -x|-gencode) shift 2 ;;
    -*) shift ;;
    *) src="$1"; shift ;;
  esac
done
printf 'FAKEBIN\n' > "$out"
cat "$src" >> "$out"
"#
            )
        })
    }

    /// Toolchain that prints a diagnostic and exits with `code` without writing an image.
    pub fn failing(name: &str, code: i32) -> io::Result<Self> {
        Self::with_body(name, |log| {
            format!(
                r#"printf '%s\n' "$@" > '{log}'
echo "kernel.cu(3): error: identifier \"undefined_symbol\" is undefined" >&2
exit {code}
"#
            )
        })
    }

    fn with_body(name: &str, body: impl FnOnce(&str) -> String) -> io::Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "dynkernel-{name}-{}-{}",
            std::process::id(),
            NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed)
        ));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let script = dir.join("fake-nvcc.sh");
        let log = dir.join("invocation.log");
        fs::write(&script, body(&log.display().to_string()))?;
        Ok(Self { dir, script, log })
    }

    pub fn config(&self) -> CompilerConfig {
        CompilerConfig::default()
            .with_launcher("sh")
            .with_nvcc(&self.script)
    }

    pub fn compiler(&self) -> KernelCompiler {
        KernelCompiler::new(self.config())
    }

    pub fn was_invoked(&self) -> bool {
        self.log.exists()
    }

    /// Arguments of the last invocation, excluding the script itself.
    pub fn recorded_args(&self) -> io::Result<Vec<String>> {
        Ok(fs::read_to_string(&self.log)?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Module path inside the scratch directory, suitable for `KernelConfig::new`.
    pub fn module_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for FakeToolchain {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
