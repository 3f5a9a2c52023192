//! The generic sandboxed runner.
//!
//! The wrapper has already built the namespace, pivoted the rootfs, and
//! dropped privileges before exec'ing us with the control-pipe base as
//! `argv[1]`. We re-root defensively, attach the control pipes, and serve
//! requests until the master tells us to stop.

use anyhow::{Context as _, Result};
use nix::unistd;
use squall_base::proto::{RunnerRequest, RunnerResponse};
use squall_util::net;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

fn main() -> Result<()> {
    // Re-root inside the namespace the wrapper prepared. Harmless when the
    // wrapper already pivoted; this is not a privilege boundary.
    unistd::chroot(".").context("chroot into current directory")?;
    unistd::chdir("/").context("chdir to /")?;

    let base = PathBuf::from(
        std::env::args_os()
            .nth(1)
            .context("usage: squall-runner <pipe-base>")?,
    );
    // Read end first, then write end; the peer opens in the complementary
    // order so neither side deadlocks.
    let input = File::open(base.with_extension("in")).context("opening control pipe for reading")?;
    let output = OpenOptions::new()
        .write(true)
        .open(base.with_extension("out"))
        .context("opening control pipe for writing")?;
    serve(input, output)
}

/// Serve requests until a stop arrives. The stop is acknowledged before the
/// loop exits so the master knows the shutdown was deliberate.
fn serve(mut input: impl Read, mut output: impl Write) -> Result<()> {
    loop {
        let request: RunnerRequest =
            net::read_message_from_pipe(&mut input).context("reading request")?;
        match request {
            RunnerRequest::Ping => {
                net::write_message_to_pipe(&mut output, RunnerResponse::Pong)
                    .context("answering ping")?;
            }
            RunnerRequest::StopRunner => {
                net::write_message_to_pipe(&mut output, RunnerResponse::Stopping)
                    .context("acknowledging stop")?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serve_answers_pings_until_stopped() {
        let mut input = Vec::new();
        net::write_message_to_pipe(&mut input, RunnerRequest::Ping).unwrap();
        net::write_message_to_pipe(&mut input, RunnerRequest::Ping).unwrap();
        net::write_message_to_pipe(&mut input, RunnerRequest::StopRunner).unwrap();

        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output).unwrap();

        let mut output = Cursor::new(output);
        assert_eq!(
            net::read_message_from_pipe::<RunnerResponse>(&mut output).unwrap(),
            RunnerResponse::Pong
        );
        assert_eq!(
            net::read_message_from_pipe::<RunnerResponse>(&mut output).unwrap(),
            RunnerResponse::Pong
        );
        assert_eq!(
            net::read_message_from_pipe::<RunnerResponse>(&mut output).unwrap(),
            RunnerResponse::Stopping
        );
    }

    #[test]
    fn serve_fails_on_eof_without_a_stop() {
        let mut input = Vec::new();
        net::write_message_to_pipe(&mut input, RunnerRequest::Ping).unwrap();
        let mut output = Vec::new();
        assert!(serve(Cursor::new(input), &mut output).is_err());
    }

    #[test]
    fn requests_after_a_stop_are_not_consumed() {
        let mut input = Vec::new();
        net::write_message_to_pipe(&mut input, RunnerRequest::StopRunner).unwrap();
        net::write_message_to_pipe(&mut input, RunnerRequest::Ping).unwrap();

        let mut cursor = Cursor::new(input);
        let mut output = Vec::new();
        serve(&mut cursor, &mut output).unwrap();

        // The stop handler returned before touching the next message.
        assert_eq!(
            net::read_message_from_pipe::<RunnerRequest>(&mut cursor).unwrap(),
            RunnerRequest::Ping
        );
    }
}
