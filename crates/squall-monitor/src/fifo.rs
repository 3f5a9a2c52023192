//! Per-child rendezvous fifos. A pair is created for each launch, handed to
//! the child as `<base>.in`/`<base>.out`, and unlinked as soon as both ends
//! have met; the fifo is a rendezvous, not persistent state.

use anyhow::{Context as _, Result};
use nix::{sys::stat::Mode, unistd::mkfifo};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

pub struct FifoPair {
    pub fifo_in: PathBuf,
    pub fifo_out: PathBuf,
}

impl FifoPair {
    pub fn create(base: &Path) -> Result<Self> {
        let pair = FifoPair {
            fifo_in: base.with_extension("in"),
            fifo_out: base.with_extension("out"),
        };
        for fifo in [&pair.fifo_in, &pair.fifo_out] {
            match std::fs::remove_file(fifo) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing stale fifo {}", fifo.display()))
                }
            }
            mkfifo(fifo, Mode::S_IRUSR | Mode::S_IWUSR)
                .with_context(|| format!("creating fifo {}", fifo.display()))?;
        }
        Ok(pair)
    }

    /// Unlink both fifos. Idempotent; every launch path, success or failure,
    /// ends with both fifos gone.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.fifo_in);
        let _ = std::fs::remove_file(&self.fifo_out);
    }

    /// Open the counterpart end of both fifos non-blocking, releasing a peer
    /// stuck in a blocking `open`. A counterpart can only be opened once the
    /// peer has reached that fifo, so a single pass is not enough on its own.
    fn release_peer(&self) -> (Option<File>, Option<File>) {
        let read_end = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.fifo_in)
            .ok();
        let write_end = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.fifo_out)
            .ok();
        (read_end, write_end)
    }

    /// Drive `task` (a handshake stuck talking to a dead peer) to completion
    /// by repeatedly offering counterpart ends of both fifos. The task may
    /// clear the first fifo and then block on the second, or block in a read
    /// that will only see EOF once the offered end is closed again, so the
    /// offers are renewed until the task finishes.
    pub async fn release_until_done<TaskT>(&self, mut task: TaskT) -> TaskT::Output
    where
        TaskT: Future + Unpin,
    {
        loop {
            let guards = self.release_peer();
            match timeout(Duration::from_millis(10), &mut task).await {
                Ok(value) => return value,
                Err(_) => drop(guards),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_makes_both_fifos_and_unlink_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("wrapper0");
        let pair = FifoPair::create(&base).unwrap();
        assert!(pair.fifo_in.exists());
        assert!(pair.fifo_out.exists());

        pair.unlink();
        assert!(!pair.fifo_in.exists());
        assert!(!pair.fifo_out.exists());
        // A second unlink is fine.
        pair.unlink();
    }

    #[test]
    fn create_replaces_stale_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("wrapper0");
        std::fs::write(base.with_extension("in"), "stale").unwrap();
        let pair = FifoPair::create(&base).unwrap();
        assert!(pair.fifo_in.exists());
        pair.unlink();
    }

    #[test]
    fn release_peer_provides_a_reader_for_a_blocked_writer() {
        let dir = tempfile::tempdir().unwrap();
        let pair = FifoPair::create(&dir.path().join("wrapper0")).unwrap();

        let fifo_in = pair.fifo_in.clone();
        let writer = std::thread::spawn(move || {
            // Blocks until release_peer opens the read end.
            OpenOptions::new().write(true).open(fifo_in).is_ok()
        });
        let guards = pair.release_peer();
        assert!(writer.join().unwrap());
        drop(guards);
        pair.unlink();
    }

    #[tokio::test]
    async fn release_until_done_frees_a_peer_blocked_on_either_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let pair = FifoPair::create(&dir.path().join("wrapper0")).unwrap();

        // The handshake shape: a blocking open of `.in` for writing, then a
        // blocking open of `.out` for reading, with no peer on either.
        let fifo_in = pair.fifo_in.clone();
        let fifo_out = pair.fifo_out.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let _ = OpenOptions::new().write(true).open(&fifo_in);
            let _ = File::open(&fifo_out);
        });
        pair.release_until_done(&mut task).await.unwrap();
        pair.unlink();
    }
}
