//! Byte-size accounting: `size_bytes()` must equal the linear sum
//! `Σ len(key) + len(value or 0)` after any sequence of operations.

#[cfg(test)]
mod tests {
    use crate::memtable::Memtable;

    #[test]
    fn test_put_accounts_key_and_value() {
        let mut memtable = Memtable::new(1024);

        memtable.put(b"key".to_vec(), b"value".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 3 + 5);
    }

    #[test]
    fn test_replacement_accounts_value_delta() {
        let mut memtable = Memtable::new(1024);

        memtable.put(b"key".to_vec(), b"longvalue".to_vec()).unwrap();
        memtable.put(b"key".to_vec(), b"v".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 3 + 1);
    }

    #[test]
    fn test_delete_accounts_value_as_zero() {
        let mut memtable = Memtable::new(1024);

        memtable.put(b"key".to_vec(), b"value".to_vec()).unwrap();
        memtable.delete(b"key".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 3);
    }

    #[test]
    fn test_delete_of_absent_key_accounts_key_only() {
        let mut memtable = Memtable::new(1024);

        memtable.delete(b"absent".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 6);
    }

    #[test]
    fn test_put_over_tombstone_adds_value_only() {
        let mut memtable = Memtable::new(1024);

        memtable.delete(b"key".to_vec()).unwrap();
        memtable.put(b"key".to_vec(), b"value".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 3 + 5);
    }

    #[test]
    fn test_double_delete_is_stable() {
        let mut memtable = Memtable::new(1024);

        memtable.delete(b"key".to_vec()).unwrap();
        memtable.delete(b"key".to_vec()).unwrap();

        assert_eq!(memtable.size_bytes(), 3);
        assert_eq!(memtable.entry_count(), 1);
    }

    #[test]
    fn test_mixed_sequence_matches_linear_sum() {
        let mut memtable = Memtable::new(1 << 20);

        let ops: &[(&[u8], Option<&[u8]>)] = &[
            (b"alpha", Some(b"1")),
            (b"beta", Some(b"22")),
            (b"alpha", Some(b"333")),
            (b"beta", None),
            (b"gamma", None),
            (b"gamma", Some(b"4444")),
            (b"delta", Some(b"5")),
            (b"delta", None),
        ];
        for (key, value) in ops {
            match value {
                Some(v) => {
                    memtable.put(key.to_vec(), v.to_vec()).unwrap();
                }
                None => {
                    memtable.delete(key.to_vec()).unwrap();
                }
            }
        }

        let expected: usize = memtable
            .snapshot()
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map_or(0, Vec::len))
            .sum();
        assert_eq!(memtable.size_bytes(), expected);
        assert_eq!(memtable.size_bytes(), 5 + 3 + 4 + 5 + 4 + 5);
    }
}
