//! FLAC container metadata: STREAMINFO, SEEKTABLE and the header prefix.
//!
//! Only the metadata blocks are parsed; audio frames are left to the decoder.
use std::io::Read;
use std::path::Path;
use thiserror::Error;

const FLAC_MAGIC: &[u8; 4] = b"fLaC";
const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_SEEKTABLE: u8 = 3;
const SEEKPOINT_LEN: usize = 18;
const PLACEHOLDER_SAMPLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum FlacError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid FLAC signature")]
    BadMagic,
    /// The metadata runs past the bytes supplied; `needed` is a lower bound
    /// on the total prefix length required to finish parsing.
    #[error("FLAC metadata truncated, need at least {needed} bytes")]
    Truncated { needed: u64 },
    #[error("FLAC stream has no STREAMINFO block")]
    MissingStreamInfo,
    #[error("FLAC stream has no usable SEEKTABLE")]
    MissingSeekTable,
    #[error("FLAC parsing error: {0}")]
    Malformed(String),
}

/// A seek point with its byte offset resolved to an absolute file position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPoint {
    pub sample_number: u64,
    pub byte_offset: u64,
}

/// Metadata extracted from the head of a FLAC file
#[derive(Debug, Clone)]
pub struct FlacMetadata {
    pub sample_rate: u32,
    pub channels: u16,
    pub total_samples: u64,
    /// Absolute byte offset of the first audio frame
    pub audio_offset: u64,
    /// Seek points sorted by sample number, placeholders removed
    pub seek_points: Vec<SeekPoint>,
    /// Metadata blocks to prefix onto a partial fetch so the decoder sees a
    /// valid stream. The SEEKTABLE is left out: its offsets refer to the
    /// whole file and would be wrong for a sub-range.
    pub header_bytes: Vec<u8>,
}

impl FlacMetadata {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.total_samples as f64 / self.sample_rate as f64
    }

    pub fn require_seek_table(&self) -> Result<(), FlacError> {
        if self.seek_points.is_empty() {
            Err(FlacError::MissingSeekTable)
        } else {
            Ok(())
        }
    }
}

/// Parse the metadata blocks at the start of `data`.
///
/// `data` only needs to hold the metadata prefix; if it ends early a
/// `FlacError::Truncated` tells the caller how much more to read.
pub fn parse_metadata(data: &[u8]) -> Result<FlacMetadata, FlacError> {
    if data.len() < 4 {
        return Err(FlacError::Truncated { needed: 4 });
    }
    if &data[0..4] != FLAC_MAGIC {
        return Err(FlacError::BadMagic);
    }

    let mut pos = 4usize;
    let mut stream_info: Option<(u32, u16, u64)> = None;
    let mut raw_seek_points: Vec<(u64, u64)> = Vec::new();
    let mut header_bytes = Vec::with_capacity(8192);
    header_bytes.extend_from_slice(FLAC_MAGIC);

    loop {
        if pos + 4 > data.len() {
            return Err(FlacError::Truncated {
                needed: (pos + 4) as u64,
            });
        }
        let header_byte = data[pos];
        let is_last = (header_byte & 0x80) != 0;
        let block_type = header_byte & 0x7F;
        let block_size =
            u32::from_be_bytes([0, data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let body_start = pos + 4;
        let body_end = body_start + block_size;
        if body_end > data.len() {
            return Err(FlacError::Truncated {
                needed: body_end as u64,
            });
        }
        let block = &data[body_start..body_end];

        match block_type {
            BLOCK_STREAMINFO => {
                if block.len() < 18 {
                    return Err(FlacError::Malformed("STREAMINFO too short".into()));
                }
                // Sample rate: 20 bits, channels: 3 bits (minus one), total samples: 36 bits
                let sample_rate = ((block[10] as u32) << 12)
                    | ((block[11] as u32) << 4)
                    | ((block[12] as u32) >> 4);
                let channels = (((block[12] >> 1) & 0x07) + 1) as u16;
                let total_samples = (((block[13] & 0x0F) as u64) << 32)
                    | ((block[14] as u64) << 24)
                    | ((block[15] as u64) << 16)
                    | ((block[16] as u64) << 8)
                    | (block[17] as u64);
                stream_info = Some((sample_rate, channels, total_samples));
            }
            BLOCK_SEEKTABLE => {
                for point in block.chunks_exact(SEEKPOINT_LEN) {
                    let sample = u64::from_be_bytes(point[0..8].try_into().unwrap_or_default());
                    let offset = u64::from_be_bytes(point[8..16].try_into().unwrap_or_default());
                    if sample != PLACEHOLDER_SAMPLE {
                        raw_seek_points.push((sample, offset));
                    }
                }
            }
            _ => {}
        }

        if block_type != BLOCK_SEEKTABLE {
            header_bytes.push(header_byte & 0x7F);
            header_bytes.extend_from_slice(&data[pos + 1..body_end]);
        }

        pos = body_end;
        if is_last {
            break;
        }
    }

    let (sample_rate, channels, total_samples) =
        stream_info.ok_or(FlacError::MissingStreamInfo)?;
    mark_last_block(&mut header_bytes);

    let audio_offset = pos as u64;
    let mut seek_points: Vec<SeekPoint> = raw_seek_points
        .into_iter()
        .map(|(sample_number, offset)| SeekPoint {
            sample_number,
            byte_offset: audio_offset + offset,
        })
        .collect();
    seek_points.sort_by_key(|p| p.sample_number);
    seek_points.dedup_by_key(|p| p.sample_number);

    Ok(FlacMetadata {
        sample_rate,
        channels,
        total_samples,
        audio_offset,
        seek_points,
        header_bytes,
    })
}

/// Set the last-block flag on the final metadata block of a rebuilt header.
fn mark_last_block(headers: &mut [u8]) {
    let mut scan_pos = 4;
    let mut last_block_pos = None;
    while scan_pos + 4 <= headers.len() {
        last_block_pos = Some(scan_pos);
        let block_size = u32::from_be_bytes([
            0,
            headers[scan_pos + 1],
            headers[scan_pos + 2],
            headers[scan_pos + 3],
        ]) as usize;
        scan_pos += 4 + block_size;
    }
    if let Some(pos) = last_block_pos {
        headers[pos] |= 0x80;
    }
}

/// Read just enough of a local file to parse its metadata.
pub fn read_metadata(path: &Path) -> Result<FlacMetadata, FlacError> {
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    let mut want: u64 = 64 * 1024;
    loop {
        let have = data.len() as u64;
        if want > have {
            let read = (&mut file).take(want - have).read_to_end(&mut data)?;
            if read == 0 && (data.len() as u64) < want {
                return Err(FlacError::Malformed("file ends inside metadata".into()));
            }
        }
        match parse_metadata(&data) {
            Err(FlacError::Truncated { needed }) => want = needed.max(want * 2),
            other => return other,
        }
    }
}

/// Last seek point at or before `sample`.
pub fn seek_point_at_or_before(points: &[SeekPoint], sample: u64) -> Option<SeekPoint> {
    let idx = points.partition_point(|p| p.sample_number <= sample);
    idx.checked_sub(1).map(|i| points[i])
}

/// First seek point at or after `sample`.
pub fn seek_point_at_or_after(points: &[SeekPoint], sample: u64) -> Option<SeekPoint> {
    let idx = points.partition_point(|p| p.sample_number < sample);
    points.get(idx).copied()
}

/// Build a FLAC metadata prefix for tests: STREAMINFO, optional SEEKTABLE
/// (offsets relative to the first frame), and a padding block.
#[cfg(test)]
pub(crate) fn build_test_header(
    sample_rate: u32,
    channels: u16,
    total_samples: u64,
    seek_points: &[(u64, u64)],
) -> Vec<u8> {
    let mut out = FLAC_MAGIC.to_vec();
    let mut info = [0u8; 34];
    info[10] = (sample_rate >> 12) as u8;
    info[11] = (sample_rate >> 4) as u8;
    info[12] = (((sample_rate & 0x0F) as u8) << 4) | ((((channels - 1) as u8) & 0x07) << 1);
    info[13] = ((total_samples >> 32) & 0x0F) as u8;
    info[14..18].copy_from_slice(&(total_samples as u32).to_be_bytes());
    out.push(BLOCK_STREAMINFO);
    out.extend_from_slice(&(34u32.to_be_bytes()[1..]));
    out.extend_from_slice(&info);
    if !seek_points.is_empty() {
        out.push(BLOCK_SEEKTABLE);
        let len = (seek_points.len() * SEEKPOINT_LEN) as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        for (sample, offset) in seek_points {
            out.extend_from_slice(&sample.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&4096u16.to_be_bytes());
        }
    }
    out.push(0x80 | 1);
    out.extend_from_slice(&(8u32.to_be_bytes()[1..]));
    out.extend_from_slice(&[0u8; 8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_streaminfo_and_seektable() {
        let header = build_test_header(44100, 2, 441000, &[(0, 0), (44100, 5000)]);
        let meta = parse_metadata(&header).unwrap();

        assert_eq!(meta.sample_rate, 44100);
        assert_eq!(meta.channels, 2);
        assert_eq!(meta.total_samples, 441000);
        assert_eq!(meta.audio_offset, header.len() as u64);
        assert!((meta.duration_secs() - 10.0).abs() < 1e-9);
        assert_eq!(
            meta.seek_points,
            vec![
                SeekPoint {
                    sample_number: 0,
                    byte_offset: meta.audio_offset,
                },
                SeekPoint {
                    sample_number: 44100,
                    byte_offset: meta.audio_offset + 5000,
                },
            ]
        );
    }

    #[test]
    fn test_header_prefix_omits_seektable_and_keeps_last_flag() {
        let header = build_test_header(48000, 2, 48000, &[(0, 0)]);
        let meta = parse_metadata(&header).unwrap();

        // magic + STREAMINFO (4+34) + padding (4+8)
        assert_eq!(meta.header_bytes.len(), 4 + 38 + 12);
        assert_eq!(meta.header_bytes[4] & 0x7F, BLOCK_STREAMINFO);
        assert_eq!(meta.header_bytes[4] & 0x80, 0);
        assert_eq!(meta.header_bytes[42], 0x80 | 1);

        let reparsed = parse_metadata(&meta.header_bytes).unwrap();
        assert!(reparsed.seek_points.is_empty());
        assert_eq!(reparsed.sample_rate, 48000);
    }

    #[test]
    fn test_placeholder_seekpoints_are_skipped() {
        let header = build_test_header(44100, 2, 441000, &[(0, 0), (u64::MAX, 0)]);
        let meta = parse_metadata(&header).unwrap();
        assert_eq!(meta.seek_points.len(), 1);
    }

    #[test]
    fn test_truncated_reports_needed_length() {
        let header = build_test_header(44100, 2, 441000, &[(0, 0)]);
        match parse_metadata(&header[..20]) {
            Err(FlacError::Truncated { needed }) => assert!(needed > 20),
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            parse_metadata(b"OggS\0\0\0\0"),
            Err(FlacError::BadMagic)
        ));
    }

    #[test]
    fn test_missing_seek_table_is_reported() {
        let header = build_test_header(44100, 2, 441000, &[]);
        let meta = parse_metadata(&header).unwrap();
        assert!(matches!(
            meta.require_seek_table(),
            Err(FlacError::MissingSeekTable)
        ));
    }

    #[test]
    fn test_seek_lookup_boundaries() {
        let points = [
            SeekPoint {
                sample_number: 0,
                byte_offset: 100,
            },
            SeekPoint {
                sample_number: 44100,
                byte_offset: 5100,
            },
            SeekPoint {
                sample_number: 88200,
                byte_offset: 10100,
            },
        ];
        let byte = |p: Option<SeekPoint>| p.map(|p| p.byte_offset);
        assert_eq!(byte(seek_point_at_or_before(&points, 50000)), Some(5100));
        assert_eq!(byte(seek_point_at_or_before(&points, 44100)), Some(5100));
        assert_eq!(byte(seek_point_at_or_before(&points, 0)), Some(100));
        assert_eq!(byte(seek_point_at_or_after(&points, 50000)), Some(10100));
        assert_eq!(byte(seek_point_at_or_after(&points, 88200)), Some(10100));
        assert_eq!(seek_point_at_or_after(&points, 90000), None);
    }

    #[test]
    fn test_read_metadata_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let header = build_test_header(96000, 2, 96000 * 3, &[(0, 0)]);
        file.write_all(&header).unwrap();
        file.write_all(&[0xFFu8; 1024]).unwrap();
        file.flush().unwrap();

        let meta = read_metadata(file.path()).unwrap();
        assert_eq!(meta.sample_rate, 96000);
        assert!((meta.duration_secs() - 3.0).abs() < 1e-9);
    }
}
