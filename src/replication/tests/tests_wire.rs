//! Wire-format checks: record tags and field names must match the
//! protocol exactly, including the camelCase legacy names.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::replication::ReplicationRecord;
    use crate::table::Placement;

    fn to_json(record: &ReplicationRecord) -> Value {
        serde_json::to_value(record).unwrap()
    }

    #[test]
    fn test_schema_record_tags() {
        assert_eq!(
            to_json(&ReplicationRecord::CreateDatabase { db: "d".into() }),
            json!({"type": "createDatabase", "db": "d"})
        );
        assert_eq!(
            to_json(&ReplicationRecord::DropDatabase { db: "d".into() }),
            json!({"type": "dropDatabase", "db": "d"})
        );
        assert_eq!(
            to_json(&ReplicationRecord::CreateTable {
                db: "d".into(),
                table: "t".into()
            }),
            json!({"type": "createTable", "db": "d", "table": "t"})
        );
        assert_eq!(
            to_json(&ReplicationRecord::DropTable {
                db: "d".into(),
                table: "t".into()
            }),
            json!({"type": "dropTable", "db": "d", "table": "t"})
        );
    }

    #[test]
    fn test_replica_records_flatten_placement() {
        let record = ReplicationRecord::TableReplicaInsert {
            db: "d".into(),
            table: "t".into(),
            row_id: "r1".into(),
            placement: Placement::new("node-a", "node-b"),
        };
        assert_eq!(
            to_json(&record),
            json!({
                "type": "TableReplicaInsert",
                "db": "d",
                "table": "t",
                "row_id": "r1",
                "primary": "node-a",
                "secondary": "node-b"
            })
        );
    }

    #[test]
    fn test_select_uses_camel_case_select_what() {
        let record = ReplicationRecord::SelectRespond {
            db: "d".into(),
            table: "t".into(),
            col: "name".into(),
            val: "ada".into(),
            select_what: "*".into(),
        };
        let value = to_json(&record);
        assert_eq!(value["selectWhat"], json!("*"));
        assert!(value.get("select_what").is_none());
    }

    #[test]
    fn test_delete_everything_is_bare() {
        assert_eq!(
            to_json(&ReplicationRecord::DeleteEverything),
            json!({"type": "DeleteEverything"})
        );
    }

    #[test]
    fn test_roundtrip_through_bytes() {
        let records = vec![
            ReplicationRecord::Insert {
                db: "d".into(),
                table: "t".into(),
                row: json!({"__uuid": "r1", "name": "ada"}),
            },
            ReplicationRecord::ReplicateUpdateObject {
                db: "d".into(),
                table: "t".into(),
                row_id: "r1".into(),
                where_col: "name".into(),
                where_val: "ada".into(),
                update_key: "name".into(),
                update_val: json!("grace"),
            },
            ReplicationRecord::SendTableReplicaToNode {
                db: "d".into(),
                table: "t".into(),
                node_id: "n2".into(),
                node_ip: "10.0.0.2".into(),
            },
        ];
        for record in records {
            let bytes = serde_json::to_vec(&record).unwrap();
            let parsed: ReplicationRecord = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(parsed, record);
        }
    }
}
