//! Property tests for the object store's versioning rules.

use proptest::prelude::*;
use stowage_core::{CoreError, Entity, ObjectStore};

#[derive(Debug, Clone)]
enum Step {
    Put(i64),
    Update(i64),
    /// Mark clean with the version seen this many mutations ago.
    MarkClean(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<i64>().prop_map(Step::Put),
        any::<i64>().prop_map(Step::Update),
        (0usize..4).prop_map(Step::MarkClean),
    ]
}

proptest! {
    #[test]
    fn mark_clean_only_succeeds_for_current_version(steps in prop::collection::vec(step(), 1..40)) {
        let store = ObjectStore::new();
        let entity = Entity::new("Counter").unwrap();
        let key = entity.key();
        let mut versions = vec![store.put(entity.clone()).unwrap()];
        let mut dirty = true;

        for step in steps {
            match step {
                Step::Put(n) => {
                    let mut copy = entity.clone();
                    copy.set("n", n).unwrap();
                    versions.push(store.put(copy).unwrap());
                    dirty = true;
                }
                Step::Update(n) => {
                    versions.push(store.update(key, |e| e.set("n", n)).unwrap());
                    dirty = true;
                }
                Step::MarkClean(back) => {
                    let index = versions.len().saturating_sub(back + 1);
                    let version = versions[index];
                    let current = *versions.last().unwrap();
                    let result = store.mark_clean(key, version);
                    if version == current {
                        prop_assert!(result.is_ok());
                        dirty = false;
                    } else {
                        let is_conflict = matches!(result, Err(CoreError::VersionConflict { .. }));
                        prop_assert!(is_conflict);
                    }
                }
            }

            let stored = store.get(key).unwrap();
            prop_assert_eq!(stored.version(), *versions.last().unwrap());
            prop_assert_eq!(stored.is_dirty(), dirty);
        }
    }

    #[test]
    fn versions_strictly_increase(updates in 1usize..30) {
        let store = ObjectStore::new();
        let entity = Entity::new("Counter").unwrap();
        let key = entity.key();
        let mut last = store.put(entity).unwrap();

        for i in 0..updates {
            let next = store.update(key, |e| e.set("i", i as i64)).unwrap();
            prop_assert!(next > last);
            last = next;
        }
    }
}
