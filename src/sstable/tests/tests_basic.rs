#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::memtable::{Lookup, Memtable};
    use crate::sstable::{build_sstable, file_name, parse_file_name, SSTable, SSTableError};

    fn entry(key: &str, value: Option<&str>) -> (Vec<u8>, Option<Vec<u8>>) {
        (key.as_bytes().to_vec(), value.map(|v| v.as_bytes().to_vec()))
    }

    #[test]
    fn test_build_and_get() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![
            entry("apple", Some("red")),
            entry("banana", Some("yellow")),
            entry("cherry", None),
        ];

        let sst = build_sstable(&entries, tmp.path(), 1, 0).unwrap();

        assert_eq!(sst.get(b"apple").unwrap(), Lookup::Value(b"red".to_vec()));
        assert_eq!(
            sst.get(b"banana").unwrap(),
            Lookup::Value(b"yellow".to_vec())
        );
        assert_eq!(sst.get(b"cherry").unwrap(), Lookup::Tombstone);
        assert_eq!(sst.get(b"durian").unwrap(), Lookup::Missing);
        assert_eq!(sst.get(b"aaa").unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_reopen_from_disk() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![entry("k1", Some("v1")), entry("k2", Some("v2"))];
        let path = {
            let sst = build_sstable(&entries, tmp.path(), 7, 0).unwrap();
            sst.path().to_path_buf()
        };

        let sst = SSTable::open(&path).unwrap();
        assert_eq!(sst.file_id, 7);
        assert_eq!(sst.level, 0);
        assert_eq!(sst.get(b"k1").unwrap(), Lookup::Value(b"v1".to_vec()));
        assert_eq!(sst.entry_count(), 2);
    }

    #[test]
    fn test_flush_preserves_memtable_contents() {
        let tmp = TempDir::new().unwrap();
        let mut memtable = Memtable::new(1 << 20);
        for i in 0..200 {
            memtable
                .put(format!("key{i:04}").into_bytes(), format!("value{i}").into_bytes())
                .unwrap();
        }
        for i in (0..200).step_by(3) {
            memtable.delete(format!("key{i:04}").into_bytes()).unwrap();
        }

        let snapshot = memtable.snapshot();
        let sst = build_sstable(&snapshot, tmp.path(), 1, 0).unwrap();

        for i in 0..200 {
            let key = format!("key{i:04}").into_bytes();
            assert_eq!(sst.get(&key).unwrap(), memtable.get(&key), "key {i}");
        }
        assert_eq!(sst.get(b"key9999").unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_key_range_and_overlap() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![entry("f", Some("1")), entry("m", Some("2")), entry("t", Some("3"))];

        let sst = build_sstable(&entries, tmp.path(), 1, 0).unwrap();

        assert_eq!(sst.key_range(), (b"f".as_slice(), b"t".as_slice()));
        assert!(sst.overlaps(b"a", b"g"));
        assert!(sst.overlaps(b"m", b"m"));
        assert!(sst.overlaps(b"s", b"z"));
        assert!(!sst.overlaps(b"a", b"e"));
        assert!(!sst.overlaps(b"u", b"z"));
    }

    #[test]
    fn test_iter_yields_all_entries_in_order() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![
            entry("a", Some("1")),
            entry("b", None),
            entry("c", Some("3")),
        ];

        let sst = build_sstable(&entries, tmp.path(), 1, 0).unwrap();
        let collected: Vec<_> = sst.iter().collect::<Result<_, _>>().unwrap();

        assert_eq!(collected, entries);
    }

    #[test]
    fn test_large_table_uses_sparse_index() {
        let tmp = TempDir::new().unwrap();
        // ~100 bytes per entry, 2000 entries ≈ 200 KiB of data: more than
        // one index entry, far fewer than one per key.
        let value = "x".repeat(90);
        let entries: Vec<_> = (0..2000)
            .map(|i| entry(&format!("key{i:06}"), Some(&value)))
            .collect();

        let sst = build_sstable(&entries, tmp.path(), 1, 0).unwrap();

        for i in [0, 1, 999, 1998, 1999] {
            let key = format!("key{i:06}").into_bytes();
            assert_eq!(
                sst.get(&key).unwrap(),
                Lookup::Value(value.as_bytes().to_vec()),
                "key {i}"
            );
        }
        assert_eq!(sst.get(b"key999999").unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_empty_input_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = build_sstable(&[], tmp.path(), 1, 0).unwrap_err();
        assert!(matches!(err, SSTableError::EmptyInput));
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!(file_name(255, 2), "00000000000000ff_2.db");
        assert_eq!(parse_file_name("00000000000000ff_2.db"), Some((255, 2)));
        assert_eq!(parse_file_name("00000000000000ff.db"), Some((255, 0)));
        assert_eq!(parse_file_name("not-an-sstable.txt"), None);
        assert_eq!(parse_file_name("00000000000000ff_2.db.tmp"), None);
    }

    #[test]
    fn test_single_entry_table() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![entry("only", Some("one"))];

        let sst = build_sstable(&entries, tmp.path(), 1, 0).unwrap();

        assert_eq!(sst.get(b"only").unwrap(), Lookup::Value(b"one".to_vec()));
        assert_eq!(sst.key_range(), (b"only".as_slice(), b"only".as_slice()));
        assert_eq!(sst.entry_count(), 1);
        assert_eq!(sst.tombstone_count(), 0);
    }
}
