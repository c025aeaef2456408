use fdwxact::prelude::*;
use fdwxact::table::FdwXactTable;

fn entry(xid: TransactionId, server_id: Oid) -> FdwXactEntry {
    let key = FdwXactKey {
        database_id: 1,
        xid,
        server_id,
        user_id: 10,
    };
    FdwXactEntry::new(key, 100 + server_id, format!("fx_{}_{}", xid, server_id))
}

mod single_threaded_tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut table = FdwXactTable::with_capacity(4);
        assert!(table.is_empty());

        let e = entry(100, 1);
        let key = e.key;
        let handle = table.insert(e).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&key), Some(handle));
        assert_eq!(table.get(handle).unwrap().status, FdwXactStatus::Initial);

        let removed = table.remove(handle).unwrap();
        assert_eq!(removed.key, key);
        assert_eq!(removed.status, FdwXactStatus::Initial);
        assert!(table.is_empty());
        assert_eq!(table.find(&key), None);
        assert!(table.remove(handle).is_none());
    }

    #[test]
    fn test_stale_handle_does_not_reach_reused_slot() {
        let mut table = FdwXactTable::with_capacity(1);
        let old = table.insert(entry(100, 1)).unwrap();
        table.remove(old);

        let new = table.insert(entry(101, 1)).unwrap();
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.get_mut(old).is_none());
        assert_eq!(table.get(new).unwrap().key.xid, 101);
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let mut table = FdwXactTable::with_capacity(2);
        table.insert(entry(100, 1)).unwrap();

        let err = table.insert(entry(100, 1)).unwrap_err();
        assert!(matches!(err, FdwXactError::DuplicateEntry(_)));

        table.insert(entry(100, 2)).unwrap();
        let err = table.insert(entry(100, 3)).unwrap_err();
        assert!(matches!(err, FdwXactError::TableFull { max: 2 }));
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn test_chain_per_transaction() {
        let mut table = FdwXactTable::with_capacity(8);
        let a = table.insert(entry(100, 1)).unwrap();
        let b = table.insert(entry(100, 2)).unwrap();
        let c = table.insert(entry(100, 3)).unwrap();
        let other = table.insert(entry(200, 1)).unwrap();
        for handle in [a, b, c, other] {
            table.link(handle);
        }
        // Linking twice is harmless.
        table.link(c);

        assert_eq!(table.chain(1, 100), vec![c, b, a]);
        assert_eq!(table.chain(1, 200), vec![other]);

        table.remove(b);
        assert_eq!(table.chain(1, 100), vec![c, a]);
        table.remove(c);
        assert_eq!(table.chain(1, 100), vec![a]);
        table.remove(a);
        assert!(table.chain(1, 100).is_empty());
        assert_eq!(table.chain(1, 200), vec![other]);
    }

    #[test]
    fn test_handles_for_xid_includes_unlinked_entries() {
        let mut table = FdwXactTable::with_capacity(8);
        let linked = table.insert(entry(100, 1)).unwrap();
        table.link(linked);
        let preparing = table.insert(entry(100, 2)).unwrap();
        table.insert(entry(101, 1)).unwrap();

        assert_eq!(table.chain(1, 100), vec![linked]);
        assert_eq!(table.handles_for_xid(1, 100), vec![linked, preparing]);
        assert!(table.handles_for_xid(2, 100).is_empty());
    }
}
