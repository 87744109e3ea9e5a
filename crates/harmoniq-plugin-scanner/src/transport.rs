use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::protocol::Message;

/// Marks the start of every frame so that stray output on the channel is
/// detected instead of being parsed as a length.
const FRAME_MAGIC: u32 = 0x4851_5053;
const MAX_FRAME_LEN: usize = 1 << 20;

/// Writing half of the framed channel. Clones share the same stream.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: Arc<Mutex<BufWriter<W>>>,
}

impl<W: Write> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
        }
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        let payload = message.encode();
        let len = u32::try_from(payload.len()).context("message too large to frame")?;
        let mut writer = self.writer.lock();
        writer.write_all(&FRAME_MAGIC.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush().context("failed to flush message")?;
        Ok(())
    }
}

/// Reading half of the framed channel.
#[derive(Debug)]
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Next message, or `None` once the peer closed the channel cleanly.
    pub fn recv(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; 8];
        if !read_exact_or_eof(&mut self.reader, &mut header)? {
            return Ok(None);
        }
        let [m0, m1, m2, m3, l0, l1, l2, l3] = header;
        let magic = u32::from_le_bytes([m0, m1, m2, m3]);
        if magic != FRAME_MAGIC {
            bail!("corrupt frame header {magic:#010x}");
        }
        let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        if len > MAX_FRAME_LEN {
            bail!("frame of {len} bytes exceeds limit");
        }
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .context("channel closed mid-frame")?;
        Ok(Some(Message::decode(&payload)))
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => bail!("channel closed mid-header"),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::{Tag, WorkerPhase};

    #[test]
    fn frames_survive_a_pipe() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let writer = FrameWriter::new(writer);
        writer.send(&Message::state(&WorkerPhase::Ready)).unwrap();
        writer.send(&Message::name("/plugins/a.clap")).unwrap();
        drop(writer);

        let mut reader = FrameReader::new(reader);
        assert_eq!(reader.recv().unwrap(), Some(Message::state(&WorkerPhase::Ready)));
        let name = reader.recv().unwrap().unwrap();
        assert_eq!(name.tag, Tag::Name);
        assert_eq!(name.payload, "/plugins/a.clap");
        assert_eq!(reader.recv().unwrap(), None);
    }

    #[test]
    fn stray_bytes_are_rejected() {
        let mut reader = FrameReader::new(&b"hello from a chatty plugin\n"[..]);
        assert!(reader.recv().is_err());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut bytes = FRAME_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(b"stat");
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(reader.recv().is_err());
    }
}
