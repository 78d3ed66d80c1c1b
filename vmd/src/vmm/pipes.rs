use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::fs::{File, OpenOptions};

use crate::errors::{Error, Result};

pub struct PipePaths {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
}

impl PipePaths {
    pub fn for_vm(vm_dir: &Path, id: &str) -> Self {
        Self {
            stdin: vm_dir.join(format!("{id}.stdin")),
            stdout: vm_dir.join(format!("{id}.stdout")),
        }
    }
}

/// Creates the two serial FIFOs for `id` under `vm_dir`, mode 0600.
pub fn create(vm_dir: &Path, id: &str) -> Result<PipePaths> {
    let paths = PipePaths::for_vm(vm_dir, id);
    for path in [&paths.stdin, &paths.stdout] {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| Error::Pipe(format!("failed to remove stale pipe {path:?}: {e}")))?;
        }
        mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::Pipe(format!("failed to create fifo {path:?}: {e}")))?;
    }
    Ok(paths)
}

/// Unlinks both FIFOs for `id`, best-effort.
pub fn destroy(vm_dir: &Path, id: &str) {
    let paths = PipePaths::for_vm(vm_dir, id);
    for path in [&paths.stdin, &paths.stdout] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?path, error = %e, "failed to remove pipe");
            }
        }
    }
}

/// Opens a FIFO read-write so the open call never blocks regardless of
/// which end dials in first.
pub async fn open_read_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| Error::Pipe(format!("failed to open {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn create_makes_both_fifos_and_destroy_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create(dir.path(), "vm-1").unwrap();

        assert!(paths.stdin.exists());
        assert!(paths.stdout.exists());

        destroy(dir.path(), "vm-1");

        assert!(!paths.stdin.exists());
        assert!(!paths.stdout.exists());
    }

    #[tokio::test]
    async fn opened_end_can_round_trip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create(dir.path(), "vm-2").unwrap();

        let mut writer = open_read_write(&paths.stdin).await.unwrap();
        let mut reader = open_read_write(&paths.stdin).await.unwrap();

        writer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        destroy(dir.path(), "vm-2");
    }
}
