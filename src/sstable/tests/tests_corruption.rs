//! Damage tolerance: a reader must refuse any file whose magics,
//! checksum, or structure do not hold, and never panic on torn bytes.

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::sstable::{build_sstable, SSTable, SSTableError};

    fn build_sample(tmp: &TempDir) -> std::path::PathBuf {
        let entries: Vec<_> = (0..50)
            .map(|i| {
                (
                    format!("key{i:03}").into_bytes(),
                    Some(format!("value{i}").into_bytes()),
                )
            })
            .collect();
        let sst = build_sstable(&entries, tmp.path(), 3, 0).unwrap();
        sst.path().to_path_buf()
    }

    #[test]
    fn test_flipped_data_byte_fails_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = build_sample(&tmp);

        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(msg) if msg.contains("checksum")));
    }

    #[test]
    fn test_bad_header_magic_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build_sample(&tmp);

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(msg) if msg.contains("header magic")));
    }

    #[test]
    fn test_bad_trailing_magic_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build_sample(&tmp);

        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 1] = b'X';
        fs::write(&path, &bytes).unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(msg) if msg.contains("trailing magic")));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build_sample(&tmp);

        let mut bytes = fs::read(&path).unwrap();
        bytes[4] = 99;
        fs::write(&path, &bytes).unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(msg) if msg.contains("version")));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build_sample(&tmp);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(SSTable::open(&path).is_err());
    }

    #[test]
    fn test_tiny_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("0000000000000001_0.db");
        fs::write(&path, b"SST1").unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(_)));
    }

    #[test]
    fn test_bad_filename_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("whatever.db");
        fs::write(&path, b"SST1").unwrap();

        let err = SSTable::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corrupted(msg) if msg.contains("filename")));
    }
}
