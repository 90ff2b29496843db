//! `json-row-frame-v1` body format: a single gzip member wrapping a
//! concatenation of `<length:u32-be><json-bytes>` frames, so a multi-page
//! bundle still decompresses as one gzip stream (spec.md §4.3).

use std::io::{
    Read,
    Write,
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use flate2::{
    read::GzDecoder,
    write::GzEncoder,
    Compression,
};

pub fn encode_row_frames(rows: &[serde_json::Value]) -> anyhow::Result<Vec<u8>> {
    let mut framed = Vec::new();
    for row in rows {
        let bytes = serde_json::to_vec(row)?;
        framed.write_u32::<BigEndian>(bytes.len() as u32)?;
        framed.extend_from_slice(&bytes);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&framed)?;
    Ok(encoder.finish()?)
}

pub fn decode_row_frames(compressed: &[u8]) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut framed = Vec::new();
    decoder.read_to_end(&mut framed)?;

    let mut rows = Vec::new();
    let mut cursor = std::io::Cursor::new(framed);
    loop {
        let len = match cursor.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(_) => break,
        };
        let mut buf = vec![0u8; len as usize];
        std::io::Read::read_exact(&mut cursor, &mut buf)?;
        rows.push(serde_json::from_slice::<serde_json::Value>(&buf)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_rows() {
        let rows = vec![
            serde_json::json!({"title": "a"}),
            serde_json::json!({"title": "b", "n": 2}),
        ];
        let encoded = encode_row_frames(&rows).unwrap();
        let decoded = decode_row_frames(&encoded).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn round_trips_empty_page() {
        let encoded = encode_row_frames(&[]).unwrap();
        let decoded = decode_row_frames(&encoded).unwrap();
        assert!(decoded.is_empty());
    }
}
