use ofs_model::{ScopeId, SyncDomain, Watermark};
use ofs_store::{MemoryStore, TieredStore};
use ofs_sync::{WatermarkRecord, WatermarkStore};
use ofs_test_utils::at;
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn domains() -> [SyncDomain; 2] {
    [SyncDomain::ScopeList, SyncDomain::Scope(ScopeId::new("p1"))]
}

proptest! {
    #[test]
    fn watermarks_only_move_forward(
        lookback in 0i64..120,
        steps in prop::collection::vec((0usize..2, 0i64..10_000), 1..60),
    ) {
        let rt = runtime();
        let store = Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))));
        let lookback = chrono::Duration::seconds(lookback);
        let wm = WatermarkStore::new("wm", lookback, Arc::clone(&store));
        let domains = domains();

        let mut previous: [Option<WatermarkRecord>; 2] = [None, None];
        let mut max_seen: [Option<i64>; 2] = [None, None];
        for (which, secs) in steps {
            let domain = &domains[which];
            let moved = rt.block_on(wm.advance(domain, at(secs)));
            prop_assert_eq!(moved, max_seen[which].map_or(true, |max| secs > max));
            let max = max_seen[which].map_or(secs, |max| max.max(secs));
            max_seen[which] = Some(max);

            let record = wm.get(domain).unwrap();
            if let Some(before) = previous[which] {
                prop_assert!(record.observed >= before.observed);
                prop_assert!(record.cursor >= before.cursor);
            }
            prop_assert_eq!(record.observed, Watermark::at(at(max)));
            prop_assert!(record.cursor <= Watermark::at(at(max)).minus(lookback));
            prop_assert_eq!(wm.cursor(domain), record.cursor);
            previous[which] = Some(record);
        }

        // a restart sees the same records
        let reopened = WatermarkStore::new("wm", lookback, store);
        rt.block_on(reopened.load());
        for (which, domain) in domains.iter().enumerate() {
            prop_assert_eq!(reopened.get(domain), previous[which]);
        }
    }
}
