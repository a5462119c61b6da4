/* `IR_NN.fir`: one infrared recording per file.
 *
 * Layout: `[u32 name_len][name][u16 edge_count][edge_count * u32]`. Each item
 * packs two level/duration pairs. There is no checksum. */

use crate::slot::validate_name;

/* Longest recording accepted, in packed edge items. */
pub const IR_EDGE_MAX: usize = 2500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrRecording {
    pub name: String,
    pub items: Vec<u32>,
}

impl IrRecording {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.name.len() + 2 + 4 * self.items.len());
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.items.len() as u16).to_le_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        let name_len = buf
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or("missing name length")?;
        let name = buf.get(4..4 + name_len).ok_or("name truncated")?;
        let name = String::from_utf8(name.to_vec()).map_err(|_| "name is not UTF-8")?;
        validate_name(&name).map_err(|e| e.to_string())?;

        let count_at = 4 + name_len;
        let count = buf
            .get(count_at..count_at + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or("missing edge count")?;
        if count > IR_EDGE_MAX {
            return Err(format!("{count} edges exceed {IR_EDGE_MAX}"));
        }
        let body = buf
            .get(count_at + 2..count_at + 2 + 4 * count)
            .ok_or_else(|| format!("{count} edges truncated"))?;
        let items = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { name, items })
    }

    /* Total playback time in microseconds; each half of an item is `level << 15 | duration`. */
    pub fn duration_us(&self) -> u64 {
        self.items
            .iter()
            .flat_map(|item| [item & 0x7fff, (item >> 16) & 0x7fff])
            .map(u64::from)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encoded_recording() {
        let rec = IrRecording {
            name: "tv_power".into(),
            items: vec![(0x8000 | 9000) | (4500 << 16), (0x8000 | 560) | (1690 << 16)],
        };
        assert_eq!(IrRecording::decode(&rec.encode()).unwrap(), rec);
        assert_eq!(rec.duration_us(), 9000 + 4500 + 560 + 1690);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let rec = IrRecording {
            name: "x".into(),
            items: vec![1, 2, 3],
        };
        let bytes = rec.encode();
        assert!(IrRecording::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
