#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use crate::engine::tests::helpers::{flush_all, init_tracing};
    use crate::engine::{Engine, EngineConfig};
    use crate::compaction::CompactionConfig;

    /// Engine that never rotates on its own and compacts only when asked.
    fn open_engine(tmp: &TempDir, l0_trigger: usize) -> Engine {
        init_tracing();
        Engine::open(
            tmp.path(),
            EngineConfig {
                mem_table_max_bytes: 1 << 30,
                max_immutable: 16,
                compaction: CompactionConfig {
                    l0_trigger,
                    level_size_ratio: 10,
                },
            },
        )
        .unwrap()
    }

    #[test]
    fn test_compaction_shrinks_disjoint_l0_tables() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp, 10);

        // Ten SSTables of 100 non-overlapping keys each.
        for batch in 0..10 {
            for i in 0..100 {
                let key = format!("key{batch:02}{i:03}");
                engine
                    .put(key.into_bytes(), format!("value{batch}-{i}").into_bytes())
                    .unwrap();
            }
            flush_all(&engine);
        }

        while engine.compact_once().unwrap() {}

        // Ten tables were flushed; compaction must have merged them down.
        let after = engine.sstable_count().unwrap();
        assert!(after < 10, "expected fewer than 10 tables, got {after}");
        for batch in 0..10 {
            for i in 0..100 {
                let key = format!("key{batch:02}{i:03}");
                assert_eq!(
                    engine.get(key.as_bytes()).unwrap(),
                    Some(format!("value{batch}-{i}").into_bytes()),
                    "missing {key} after compaction"
                );
            }
        }
    }

    #[test]
    fn test_compaction_preserves_visible_state() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp, 4);

        // Overlapping batches with overwrites and deletes.
        for round in 0..6 {
            for i in 0..50 {
                let key = format!("key{i:03}");
                if (i + round) % 7 == 0 {
                    engine.delete(key.into_bytes()).unwrap();
                } else {
                    engine
                        .put(key.into_bytes(), format!("r{round}v{i}").into_bytes())
                        .unwrap();
                }
            }
            flush_all(&engine);
        }

        let before: BTreeMap<String, Option<Vec<u8>>> = (0..50)
            .map(|i| {
                let key = format!("key{i:03}");
                let value = engine.get(key.as_bytes()).unwrap();
                (key, value)
            })
            .collect();

        while engine.compact_once().unwrap() {}

        for (key, expected) in &before {
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                *expected,
                "visible state changed for {key}"
            );
        }
    }

    #[test]
    fn test_full_compaction_drops_tombstones() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp, 2);

        for i in 0..20 {
            engine
                .put(format!("key{i:02}").into_bytes(), b"v".to_vec())
                .unwrap();
        }
        flush_all(&engine);
        for i in 0..20 {
            engine.delete(format!("key{i:02}").into_bytes()).unwrap();
        }
        flush_all(&engine);

        while engine.compact_once().unwrap() {}

        // Every key was deleted and nothing lies below the merge output,
        // so the tombstones vanish with the data.
        assert_eq!(engine.sstable_count().unwrap(), 0);
        for i in 0..20 {
            assert_eq!(engine.get(format!("key{i:02}").as_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn test_no_compaction_below_trigger() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp, 10);

        for batch in 0..3 {
            engine
                .put(format!("key{batch}").into_bytes(), b"v".to_vec())
                .unwrap();
            flush_all(&engine);
        }

        assert!(!engine.compact_once().unwrap());
        assert_eq!(engine.sstable_count().unwrap(), 3);
    }
}
