//! Property tests for the entity state store.
//!
//! Random sequences of upserts, status events and evictions are applied and
//! the merge-policy guarantees are checked afterwards: idempotence of
//! location upserts, order independence across identities, and monotone
//! target status.

use std::collections::BTreeMap;

use orrery_state::prelude::*;
use proptest::prelude::*;

/// Operations we can perform on the store.
#[derive(Debug, Clone)]
enum StoreOp {
    Satellite(u8, f64, f64),
    Target(u8, f64, f64),
    Status(u8, TargetStatus),
    Evict(u8),
}

fn finite_deg(limit: i32) -> impl Strategy<Value = f64> {
    (-limit * 100..=limit * 100).prop_map(|v| v as f64 * 0.01)
}

fn status_strategy() -> impl Strategy<Value = TargetStatus> {
    prop_oneof![
        Just(TargetStatus::Started),
        Just(TargetStatus::Detected),
        Just(TargetStatus::Reported),
    ]
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        (0..8u8, finite_deg(90), finite_deg(180)).prop_map(|(i, lat, lon)| StoreOp::Satellite(i, lat, lon)),
        (0..8u8, finite_deg(90), finite_deg(180)).prop_map(|(i, lat, lon)| StoreOp::Target(i, lat, lon)),
        (0..8u8, status_strategy()).prop_map(|(i, s)| StoreOp::Status(i, s)),
        (0..8u8).prop_map(StoreOp::Evict),
    ]
}

fn location(key: EntityKey, lat: f64, lon: f64) -> EntitySnapshot {
    EntitySnapshot::new(key, Attributes::at(GeoPosition::new(lat, lon, 0.0)))
}

/// Attributes of every record, keyed, without the trail.
fn visible_state(store: &EntityStateStore) -> BTreeMap<EntityKey, (Attributes, String, Option<TargetStatus>)> {
    store
        .all()
        .map(|r| (r.key.clone(), (r.attributes.clone(), r.category.clone(), r.status)))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    #[test]
    fn random_ops_keep_status_monotone(ops in prop::collection::vec(store_op_strategy(), 1..60)) {
        let mut store = EntityStateStore::default();
        let mut last_status: BTreeMap<EntityKey, TargetStatus> = BTreeMap::new();

        for op in ops {
            match op {
                StoreOp::Satellite(i, lat, lon) => {
                    store.upsert(location(EntityKey::satellite(i.to_string()), lat, lon));
                }
                StoreOp::Target(i, lat, lon) => {
                    store.upsert(location(EntityKey::target(i.to_string()), lat, lon));
                }
                StoreOp::Status(i, status) => {
                    let key = EntityKey::target(i.to_string());
                    let known = store.contains(&key);
                    let result = store.set_status(&key, status, None, None);
                    prop_assert_eq!(result.is_ok(), known);
                    prop_assert_eq!(store.contains(&key), known);
                }
                StoreOp::Evict(i) => {
                    let key = EntityKey::target(i.to_string());
                    store.evict(&key);
                    last_status.remove(&key);
                }
            }

            for record in store.of_kind(EntityKind::Target) {
                let status = record.status.expect("targets always carry a status");
                if let Some(previous) = last_status.insert(record.key.clone(), status) {
                    prop_assert!(status >= previous);
                }
            }
            prop_assert!(store.of_kind(EntityKind::Satellite).all(|r| r.status.is_none()));
        }
    }

    #[test]
    fn upsert_is_idempotent_except_trail(
        ids in prop::collection::vec(0..16u8, 1..20),
        lat in finite_deg(90),
        lon in finite_deg(180),
    ) {
        let mut once = EntityStateStore::default();
        let mut twice = EntityStateStore::default();
        for id in &ids {
            let snap = location(EntityKey::satellite(id.to_string()), lat, lon);
            once.upsert(snap.clone());
            twice.upsert(snap.clone());
            twice.upsert(snap);
        }
        prop_assert_eq!(visible_state(&once), visible_state(&twice));
    }

    #[test]
    fn order_across_identities_does_not_matter(
        points in prop::collection::btree_map(0..32u8, (finite_deg(90), finite_deg(180)), 1..16),
    ) {
        let snaps: Vec<EntitySnapshot> = points
            .iter()
            .map(|(id, (lat, lon))| location(EntityKey::satellite(id.to_string()), *lat, *lon))
            .collect();

        let mut forward = EntityStateStore::default();
        for s in snaps.iter().cloned() {
            forward.upsert(s);
        }
        let mut backward = EntityStateStore::default();
        for s in snaps.iter().rev().cloned() {
            backward.upsert(s);
        }

        prop_assert_eq!(visible_state(&forward), visible_state(&backward));
        prop_assert_eq!(forward.state_hash(), backward.state_hash());
    }
}
