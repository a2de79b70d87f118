//! Varint length-prefixed framing of [Message]s on a stream.

use std::cell::RefCell;
use std::io::{self, Read, Write};

use bytes::BytesMut;

use crate::common::Message;
use crate::{Error, Result};

/// Capacity of a fresh write buffer.
const WRITE_BUFFER_CAPACITY: usize = 4 * 1024;
/// Buffers grown past this are not kept around after a write.
const MAX_POOLED_BUFFER_CAPACITY: usize = 64 * 1024;
/// A u64 varint is at most 10 bytes.
const MAX_VARINT_LEN: usize = 10;

thread_local! {
    static WRITE_BUFFER: RefCell<BytesMut> = RefCell::new(BytesMut::with_capacity(WRITE_BUFFER_CAPACITY));
}

/// Write `message` to `writer` with its varint length prefix, then flush.
///
/// Encoding happens in a per-thread buffer, so a frame costs one `write_all`
/// and no allocation in the common case.
pub fn write_message<W: Write + ?Sized>(writer: &mut W, message: &Message) -> Result<()> {
    WRITE_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();

        message.encode_length_delimited(&mut buffer);

        let result = writer.write_all(&buffer).and_then(|_| writer.flush());

        if buffer.capacity() > MAX_POOLED_BUFFER_CAPACITY {
            *buffer = BytesMut::with_capacity(WRITE_BUFFER_CAPACITY);
        }

        Ok(result?)
    })
}

/// Read one frame from `reader` and decode it.
///
/// Frames announcing more than `max_size` bytes fail with [Error::MessageTooLarge]
/// before anything is allocated. A frame that was read completely but doesn't
/// decode fails with [Error::Decode], leaving the reader at the next frame.
pub fn read_message<R: Read + ?Sized>(reader: &mut R, max_size: usize) -> Result<Message> {
    let size = read_length(reader)?;

    if size > max_size {
        return Err(Error::MessageTooLarge {
            size,
            max: max_size,
        });
    }

    let mut frame = vec![0; size];
    reader.read_exact(&mut frame)?;

    Message::from_bytes(&frame)
}

/// Read the varint prefix byte by byte, never past the end of it.
fn read_length<R: Read + ?Sized>(reader: &mut R) -> Result<usize> {
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let mut len = 0;

    while len < MAX_VARINT_LEN {
        reader.read_exact(&mut prefix[len..len + 1])?;
        len += 1;

        if prefix[len - 1] & 0x80 == 0 {
            // A prefix that can't be decoded leaves the stream out of sync.
            return prost::decode_length_delimiter(&prefix[..len])
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error).into());
        }
    }

    Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow").into())
}
