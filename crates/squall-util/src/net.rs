//! Functions for reading/writing messages from/to named pipes.
//!
//! Every message is framed with a leading 4-byte, little-endian payload size
//! followed by the bincode serialization of the record. The same framing is
//! used on both ends of every pipe, so this layout is the wire contract
//! between the monitor, the wrapper, and runners.

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};

fn write_message_to_vec(msg: impl Serialize) -> Result<Vec<u8>> {
    let msg_len = bincode::serialized_size(&msg)? as u32;
    let mut buf = Vec::<u8>::with_capacity(msg_len as usize + 4);
    Write::write_all(&mut buf, &msg_len.to_le_bytes())?;
    bincode::serialize_into(&mut buf, &msg)?;
    Ok(buf)
}

/// Write a message to a normal (threaded) writer.
pub fn write_message_to_pipe(stream: &mut impl Write, msg: impl Serialize) -> Result<()> {
    stream.write_all(&write_message_to_vec(msg)?)?;
    Ok(stream.flush()?)
}

/// Write a message to a Tokio output stream.
pub async fn write_message_to_async_pipe(
    stream: &mut (impl AsyncWrite + Unpin),
    msg: impl Serialize,
) -> Result<()> {
    Ok(stream.write_all(&write_message_to_vec(msg)?).await?)
}

/// Read a message from a normal (threaded) reader. The framing must match
/// that of [`write_message_to_pipe`] and [`write_message_to_async_pipe`].
pub fn read_message_from_pipe<MessageT>(stream: &mut impl Read) -> Result<MessageT>
where
    MessageT: DeserializeOwned,
{
    let mut msg_len: [u8; 4] = [0; 4];
    stream.read_exact(&mut msg_len)?;
    let mut buf = vec![0; u32::from_le_bytes(msg_len) as usize];
    stream.read_exact(&mut buf)?;
    Ok(bincode::deserialize_from(&mut &buf[..])?)
}

/// Read a message from a Tokio input stream.
pub async fn read_message_from_async_pipe<MessageT>(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<MessageT>
where
    MessageT: DeserializeOwned,
{
    let mut msg_len: [u8; 4] = [0; 4];
    stream.read_exact(&mut msg_len).await?;
    let mut buf = vec![0; u32::from_le_bytes(msg_len) as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize_from(&mut &buf[..])?)
}

/// Loop, reading messages from a pipe and writing them to an mpsc channel.
/// Returns when the pipe yields EOF or an error, or when the channel's
/// receiver is dropped. Meant to run on its own thread; the `transform`
/// parameter wraps messages in any structure the receiving loop needs.
pub fn pipe_reader<MessageT, TransformedT>(
    mut pipe: impl Read,
    channel: UnboundedSender<TransformedT>,
    transform: impl Fn(MessageT) -> TransformedT,
) where
    MessageT: DeserializeOwned,
{
    while let Ok(msg) = read_message_from_pipe(&mut pipe) {
        if channel.send(transform(msg)).is_err() {
            break;
        }
    }
}

/// Loop, reading messages from a channel and writing them to a pipe. Returns
/// when all senders are dropped or the pipe write fails. Meant to run on its
/// own thread.
pub fn pipe_writer<MessageT>(mut channel: UnboundedReceiver<MessageT>, mut pipe: impl Write)
where
    MessageT: Serialize,
{
    while let Some(msg) = channel.blocking_recv() {
        if write_message_to_pipe(&mut pipe, msg).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squall_base::{
        proto::{MonitorResponse, MonitorToMaster},
        IdKind, IdMap, RunnerId, WrapperParameters,
    };
    use std::io::Cursor;

    fn params() -> WrapperParameters {
        WrapperParameters {
            rootfs: "/srv/rootfs".into(),
            idmaps: vec![IdMap {
                kind: IdKind::Uid,
                container_id: 0,
                host_id: 100000,
                length: 1,
            }],
            command: "/bin/true".into(),
            argv: vec!["true".into()],
            env: vec![("PATH".into(), "/usr/bin:/bin".into())],
            runuid: 1,
            rungid: 1,
            bind_system_mount: false,
            prepare_network: true,
            workdir: None,
            cgroup: Some("squall/r7".into()),
            initial_cpuset: Some(vec![2, 3]),
            runner_id: RunnerId(7),
        }
    }

    #[test]
    fn prefix_is_little_endian_payload_length() {
        let buf = write_message_to_vec(42i32).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[..4], 4u32.to_le_bytes());
        assert_eq!(buf[4..], 42i32.to_le_bytes());
    }

    #[test]
    fn wrapper_parameters_round_trip() {
        let mut buf = Vec::new();
        write_message_to_pipe(&mut buf, params()).unwrap();
        let read: WrapperParameters = read_message_from_pipe(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, params());
    }

    #[test]
    fn messages_are_read_back_in_order() {
        let mut buf = Vec::new();
        write_message_to_pipe(&mut buf, MonitorToMaster::StopRunner).unwrap();
        write_message_to_pipe(
            &mut buf,
            MonitorToMaster::Response(3, MonitorResponse::RunnerKilled),
        )
        .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_message_from_pipe::<MonitorToMaster>(&mut cursor).unwrap(),
            MonitorToMaster::StopRunner
        );
        assert_eq!(
            read_message_from_pipe::<MonitorToMaster>(&mut cursor).unwrap(),
            MonitorToMaster::Response(3, MonitorResponse::RunnerKilled)
        );
    }

    #[tokio::test]
    async fn async_and_sync_framing_agree() {
        let mut buf = Vec::new();
        write_message_to_async_pipe(&mut buf, params()).await.unwrap();
        let read: WrapperParameters = read_message_from_pipe(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read, params());

        let mut slice = &buf[..];
        let read: WrapperParameters = read_message_from_async_pipe(&mut slice).await.unwrap();
        assert_eq!(read, params());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let mut buf = Vec::new();
        write_message_to_pipe(&mut buf, params()).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_message_from_pipe::<WrapperParameters>(&mut Cursor::new(buf)).is_err());
    }
}
