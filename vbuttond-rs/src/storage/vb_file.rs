/* `NNN_VB.fms`: per-button payloads of one slot.
 *
 * One `{ header, payload }` entry per virtual button in id order. The header is
 * four little-endian `u32`: offset of the previous header, offset of the next
 * header (file length for the last entry), offset of this header, button id.
 * The payload length is implied: `next - this - HEADER_SIZE`. */

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

pub const HEADER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub prev: u32,
    pub next: u32,
    pub this: u32,
    pub vb: u32,
}

impl EntryHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        for (chunk, v) in out.chunks_exact_mut(4).zip([self.prev, self.next, self.this, self.vb]) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            prev: word(0),
            next: word(4),
            this: word(8),
            vb: word(12),
        }
    }

    pub fn payload_len(&self) -> Option<u32> {
        self.next.checked_sub(self.this)?.checked_sub(HEADER_SIZE)
    }
}

/* Serialize every payload into one file image, button `i` holding `payloads[i]`. */
pub fn encode(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0u32;
    for (vb, payload) in payloads.iter().enumerate() {
        let this = out.len() as u32;
        let header = EntryHeader {
            prev,
            next: this + HEADER_SIZE + payload.len() as u32,
            this,
            vb: vb as u32,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
        prev = this;
    }
    out
}

/* Read position inside an open payload file, kept across calls within a transaction. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    offset: u32,
    vb: u32,
}

/* Walk headers forward from `cursor` to the entry of `vb` and read its payload.
 * Other payloads are skipped with a seek. Returns `Ok(None)` if the file ends first. */
pub async fn read_entry<R>(file: &mut R, cursor: &mut Cursor, vb: u32) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if cursor.vb > vb {
        *cursor = Cursor::default();
    }
    let end = file.seek(SeekFrom::End(0)).await?;
    let mut offset = cursor.offset;

    while u64::from(offset) + u64::from(HEADER_SIZE) <= end {
        file.seek(SeekFrom::Start(u64::from(offset))).await?;
        let mut raw = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut raw).await?;
        let header = EntryHeader::from_bytes(&raw);

        let len = header
            .payload_len()
            .filter(|_| header.this == offset && u64::from(header.next) <= end)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad payload header at offset {offset}: {header:?}"),
                )
            })?;

        *cursor = Cursor { offset, vb: header.vb };
        if header.vb == vb {
            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload).await?;
            return Ok(Some(payload));
        }
        offset = header.next;
    }
    Ok(None)
}
