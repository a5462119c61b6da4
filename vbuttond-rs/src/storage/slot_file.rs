/* `NNN.fms`: slot header file.
 *
 * Layout: `[u32 name_len][name][16-byte MD5 of record][record]`, little-endian. */

use md5::{Digest, Md5};

use crate::slot::{validate_name, GeneralConfig, GENERAL_CONFIG_SIZE};

pub const CHECKSUM_SIZE: usize = 16;

/* Why a slot file did not decode. The caller attaches the path. */
#[derive(Debug, PartialEq, Eq)]
pub enum SlotFileError {
    Corrupt(String),
    Checksum,
}

pub fn checksum(record: &[u8]) -> [u8; CHECKSUM_SIZE] {
    Md5::digest(record).into()
}

pub fn encode(name: &str, config: &GeneralConfig) -> Vec<u8> {
    let record = config.to_bytes();
    let mut out = Vec::with_capacity(4 + name.len() + CHECKSUM_SIZE + GENERAL_CONFIG_SIZE);
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&checksum(&record));
    out.extend_from_slice(&record);
    out
}

/* Read only the name; the record is not verified. */
pub fn decode_name(buf: &[u8]) -> Result<String, SlotFileError> {
    let len_bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SlotFileError::Corrupt("missing name length".into()))?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let name = buf
        .get(4..4 + len)
        .ok_or_else(|| SlotFileError::Corrupt(format!("name of {len} bytes truncated")))?;
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| SlotFileError::Corrupt("name is not UTF-8".into()))?;
    validate_name(&name).map_err(|e| SlotFileError::Corrupt(e.to_string()))?;
    Ok(name)
}

/* Decode name and settings, verifying the checksum first. */
pub fn decode(buf: &[u8]) -> Result<(String, GeneralConfig), SlotFileError> {
    let name = decode_name(buf)?;
    let sum_at = 4 + name.len();
    let record_at = sum_at + CHECKSUM_SIZE;
    let stored = buf
        .get(sum_at..record_at)
        .ok_or_else(|| SlotFileError::Corrupt("checksum truncated".into()))?;
    let record = buf
        .get(record_at..record_at + GENERAL_CONFIG_SIZE)
        .ok_or_else(|| SlotFileError::Corrupt("settings record truncated".into()))?;

    if checksum(record)[..] != *stored {
        return Err(SlotFileError::Checksum);
    }
    let config = GeneralConfig::from_bytes(record).map_err(|e| SlotFileError::Corrupt(e.to_string()))?;
    Ok((name, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::factory_default;

    #[test]
    fn test_every_single_byte_flip_in_record_is_caught() {
        let image = factory_default().unwrap();
        let encoded = encode(&image.name, &image.config);
        let record_at = 4 + image.name.len() + CHECKSUM_SIZE;

        for offset in [record_at, record_at + 1, record_at + 100, encoded.len() - 1] {
            let mut corrupted = encoded.clone();
            corrupted[offset] ^= 0x01;
            assert_eq!(decode(&corrupted), Err(SlotFileError::Checksum), "offset {offset}");
        }
        assert_eq!(decode(&encoded).unwrap(), (image.name, image.config));
    }

    #[test]
    fn test_name_decoding() {
        let encoded = encode("joystick", &GeneralConfig::default());
        assert_eq!(decode_name(&encoded).unwrap(), "joystick");
        assert!(matches!(decode_name(&encoded[..6]), Err(SlotFileError::Corrupt(_))));
    }
}
