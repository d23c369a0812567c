#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::tests::helpers::{flush_all, init_tracing, open_manual_engine};
    use crate::engine::{Engine, EngineConfig};

    #[test]
    fn test_close_persists_active_memtable() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_manual_engine(&tmp);
            engine.put(b"durable".to_vec(), b"yes".to_vec()).unwrap();
            engine.close().unwrap();
        }

        let engine = open_manual_engine(&tmp);
        assert_eq!(engine.get(b"durable").unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn test_reopen_preserves_recency_order() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_manual_engine(&tmp);
            engine.put(b"k".to_vec(), b"old".to_vec()).unwrap();
            flush_all(&engine);
            engine.put(b"k".to_vec(), b"new".to_vec()).unwrap();
            flush_all(&engine);
            engine.close().unwrap();
        }

        let engine = open_manual_engine(&tmp);
        assert_eq!(engine.sstable_count().unwrap(), 2);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_deletes_survive_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_manual_engine(&tmp);
            engine.put(b"gone".to_vec(), b"v".to_vec()).unwrap();
            flush_all(&engine);
            engine.delete(b"gone".to_vec()).unwrap();
            engine.close().unwrap();
        }

        let engine = open_manual_engine(&tmp);
        assert_eq!(engine.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_open_on_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path().join("fresh"), EngineConfig::default()).unwrap();
        assert_eq!(engine.get(b"anything").unwrap(), None);
        assert_eq!(engine.sstable_count().unwrap(), 0);
    }

    #[test]
    fn test_stale_temp_files_swept_on_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("0000000000000009_0.db.tmp"), b"torn write").unwrap();

        let engine = Engine::open(tmp.path(), EngineConfig::default()).unwrap();

        assert_eq!(engine.sstable_count().unwrap(), 0);
        assert!(!tmp.path().join("0000000000000009_0.db.tmp").exists());
    }

    #[test]
    fn test_unrelated_files_ignored() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"not an sstable").unwrap();

        let engine = Engine::open(tmp.path(), EngineConfig::default()).unwrap();
        assert_eq!(engine.sstable_count().unwrap(), 0);
    }
}
